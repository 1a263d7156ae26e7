//! Type & ABI Lowering
//!
//! Maps WebAssembly value types and result tuples to native types and decides
//! whether a wasm function's results come back in registers or through the
//! context's return area.

use cranelift::codegen::ir::types;
use smallvec::SmallVec;

use super::literals::Constant;
use super::types::{NativeType, PointeeKind};
use crate::ir::{TypeTuple, ValueType, V128};

/// Native type of each value kind, indexed by `ValueType::index`
static NATIVE_VALUE_TYPES: [NativeType; ValueType::COUNT] = [
    NativeType::Scalar(types::I32),
    NativeType::Scalar(types::I64),
    NativeType::Scalar(types::F32),
    NativeType::Scalar(types::F64),
    NativeType::Scalar(types::I64X2),
    NativeType::Pointer(PointeeKind::Object),
    NativeType::Pointer(PointeeKind::Function),
];

/// Zero constant of each value kind, indexed by `ValueType::index`
static TYPED_ZERO_CONSTANTS: [Constant; ValueType::COUNT] = [
    Constant::I32(0),
    Constant::I64(0),
    Constant::F32(0),
    Constant::F64(0),
    Constant::V128(V128 { u64: [0, 0] }),
    Constant::Null(PointeeKind::Object),
    Constant::Null(PointeeKind::Function),
];

/// Results plus the implicit context pointer that fit in return registers
///
/// On x86-64 the calling conventions return up to 3 integers and 4
/// floats/vectors; allowing 3 values total keeps every combination legal.
pub const MAX_DIRECTLY_RETURNED_VALUES: usize = 3;

/// Convert a WebAssembly value type to its native type
#[inline]
pub fn lower_type(ty: ValueType) -> NativeType {
    NATIVE_VALUE_TYPES[ty.index()].clone()
}

/// Convert a tuple to one anonymous aggregate with fields in order
pub fn lower_tuple(tuple: &TypeTuple) -> NativeType {
    NativeType::Struct(tuple.iter().map(|ty| lower_type(*ty)).collect())
}

/// Zero value of a value type
#[inline]
pub fn zero_constant(ty: ValueType) -> Constant {
    TYPED_ZERO_CONSTANTS[ty.index()]
}

/// Whether `results` are returned in registers alongside the context pointer
#[inline]
pub fn results_returned_directly(results: &TypeTuple) -> bool {
    results.len() + 1 <= MAX_DIRECTLY_RETURNED_VALUES
}

/// Return type of a wasm-convention function
///
/// `{ctx, {results...}}` when the results are returned directly, otherwise
/// `{ctx}` with the results written to the context's return area.
pub fn return_struct_type(results: &TypeTuple) -> NativeType {
    if results_returned_directly(results) {
        NativeType::Struct(vec![NativeType::OPAQUE_POINTER, lower_tuple(results)])
    } else {
        NativeType::Struct(vec![NativeType::OPAQUE_POINTER])
    }
}

/// Zeroed return value of a wasm-convention function
///
/// Flattened in [`return_struct_type`] field order: a null context pointer,
/// then a zero per result when the results are returned directly.
pub fn zero_return_values(results: &TypeTuple) -> SmallVec<[Constant; MAX_DIRECTLY_RETURNED_VALUES]> {
    let mut values = SmallVec::new();
    values.push(Constant::Null(PointeeKind::Opaque));
    if results_returned_directly(results) {
        values.extend(results.iter().map(|ty| zero_constant(*ty)));
    }
    values
}
