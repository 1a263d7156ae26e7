//! Calling Convention Bridge
//!
//! Builds full native signatures for each [`CallingConvention`] and selects
//! the Cranelift calling convention that implements it.
//!
//! | convention                   | implicit params           | return                    |
//! |------------------------------|---------------------------|---------------------------|
//! | `Wasm`                       | ctx                       | `{ctx, {results}}`/`{ctx}`|
//! | `Intrinsic`                  | ctx                       | void / single result      |
//! | `IntrinsicWithContextSwitch` | ctx                       | ctx                       |
//! | `IntrinsicWithMemAndTable`   | ctx, memory id, table id  | void / single result      |
//! | `C`                          | none                      | void / single result      |

use cranelift::codegen::ir::{types, Signature};
use cranelift::codegen::isa::{CallConv, TargetIsa};

use super::lowering::{lower_type, return_struct_type};
use super::types::{JitError, JitResult, NativeFunctionType, NativeType};
use crate::ir::FunctionType;
use crate::runtime::CallingConvention;

/// Number of parameters the convention inserts before the declared ones
pub fn num_implicit_parameters(convention: CallingConvention) -> usize {
    match convention {
        CallingConvention::IntrinsicWithMemAndTable => 3,
        CallingConvention::C => 0,
        CallingConvention::Wasm
        | CallingConvention::Intrinsic
        | CallingConvention::IntrinsicWithContextSwitch => 1,
    }
}

/// Build the complete native parameter list and return type
///
/// Non-wasm conventions other than the context switch return at most one
/// value; asking for more is a compiler bug and fails with
/// [`JitError::UnsupportedResultCount`].
pub fn build_signature(
    function_type: &FunctionType,
    convention: CallingConvention,
) -> JitResult<NativeFunctionType> {
    let num_implicit = num_implicit_parameters(convention);
    let mut params = Vec::with_capacity(num_implicit + function_type.params().len());

    match convention {
        CallingConvention::IntrinsicWithMemAndTable => {
            params.push(NativeType::OPAQUE_POINTER);
            params.push(NativeType::Scalar(types::I64));
            params.push(NativeType::Scalar(types::I64));
        }
        CallingConvention::C => {}
        _ => params.push(NativeType::OPAQUE_POINTER),
    }
    params.extend(function_type.params().iter().map(|ty| lower_type(*ty)));

    let ret = match convention {
        CallingConvention::Wasm => return_struct_type(function_type.results()),
        CallingConvention::IntrinsicWithContextSwitch => NativeType::OPAQUE_POINTER,
        CallingConvention::Intrinsic
        | CallingConvention::IntrinsicWithMemAndTable
        | CallingConvention::C => match function_type.results().len() {
            0 => NativeType::Void,
            1 => lower_type(function_type.results()[0]),
            results => {
                return Err(JitError::UnsupportedResultCount {
                    convention,
                    results,
                })
            }
        },
    };

    Ok(NativeFunctionType { params, ret })
}

/// Cranelift calling convention implementing `convention`
///
/// wasm-to-wasm calls use the tail convention, which is free to differ from
/// the platform ABI; everything that must interoperate with host code uses
/// the ISA's default C convention.
pub fn native_call_conv(convention: CallingConvention, isa: &dyn TargetIsa) -> CallConv {
    match convention {
        CallingConvention::Wasm => CallConv::Tail,
        CallingConvention::Intrinsic
        | CallingConvention::IntrinsicWithContextSwitch
        | CallingConvention::IntrinsicWithMemAndTable
        | CallingConvention::C => isa.default_call_conv(),
    }
}

/// Cranelift signature of a function of `function_type` called with `convention`
pub fn native_signature(
    function_type: &FunctionType,
    convention: CallingConvention,
    isa: &dyn TargetIsa,
) -> JitResult<Signature> {
    let native = build_signature(function_type, convention)?;
    Ok(native.to_signature(native_call_conv(convention, isa), isa.pointer_type()))
}
