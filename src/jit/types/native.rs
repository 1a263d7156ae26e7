//! Native (backend-level) types.
//!
//! Cranelift has no aggregate or typed-pointer types, so lowering produces
//! [`NativeType`] first and flattens it to `AbiParam`s when a signature is
//! built. Pointers keep their pointee kind so that distinct wasm reference
//! types stay distinct after lowering.

use std::fmt;

use cranelift::codegen::ir::{AbiParam, Signature, Type};
use cranelift::codegen::isa::CallConv;
use smallvec::SmallVec;

/// Lowered values of a native type, in order
pub type NativeTypeVector = SmallVec<[Type; 4]>;

/// What a native pointer refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointeeKind {
    /// Untyped bytes (the context pointer)
    Opaque,
    /// A runtime object (`anyref`)
    Object,
    /// A function (`funcref`)
    Function,
}

/// A type in the backend's type system
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NativeType {
    /// No value
    Void,
    /// A Cranelift scalar or vector type
    Scalar(Type),
    /// A pointer-width value
    Pointer(PointeeKind),
    /// An anonymous aggregate; fields keep their order
    Struct(Vec<NativeType>),
}

impl NativeType {
    /// The opaque context pointer type
    pub const OPAQUE_POINTER: NativeType = NativeType::Pointer(PointeeKind::Opaque);

    pub fn is_void(&self) -> bool {
        matches!(self, NativeType::Void)
    }

    /// Fields of an aggregate (empty for non-aggregates)
    pub fn fields(&self) -> &[NativeType] {
        match self {
            NativeType::Struct(fields) => fields,
            _ => &[],
        }
    }

    /// The single Cranelift type of a scalar or pointer
    pub fn as_scalar(&self, pointer_type: Type) -> Option<Type> {
        match self {
            NativeType::Scalar(ty) => Some(*ty),
            NativeType::Pointer(_) => Some(pointer_type),
            NativeType::Void | NativeType::Struct(_) => None,
        }
    }

    /// Append the Cranelift types of this type in field order
    pub fn flatten_into(&self, pointer_type: Type, out: &mut NativeTypeVector) {
        match self {
            NativeType::Void => {}
            NativeType::Scalar(ty) => out.push(*ty),
            NativeType::Pointer(_) => out.push(pointer_type),
            NativeType::Struct(fields) => {
                for field in fields {
                    field.flatten_into(pointer_type, out);
                }
            }
        }
    }

    pub fn flatten(&self, pointer_type: Type) -> NativeTypeVector {
        let mut out = NativeTypeVector::new();
        self.flatten_into(pointer_type, &mut out);
        out
    }

    pub fn to_abi_params(&self, pointer_type: Type) -> SmallVec<[AbiParam; 4]> {
        self.flatten(pointer_type)
            .into_iter()
            .map(AbiParam::new)
            .collect()
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeType::Void => write!(f, "void"),
            NativeType::Scalar(ty) => write!(f, "{}", ty),
            NativeType::Pointer(PointeeKind::Opaque) => write!(f, "ptr"),
            NativeType::Pointer(PointeeKind::Object) => write!(f, "objectptr"),
            NativeType::Pointer(PointeeKind::Function) => write!(f, "funcptr"),
            NativeType::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A complete native function signature before calling-convention tagging
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeFunctionType {
    pub params: Vec<NativeType>,
    pub ret: NativeType,
}

impl NativeFunctionType {
    /// Build the Cranelift signature for this type under `call_conv`
    pub fn to_signature(&self, call_conv: CallConv, pointer_type: Type) -> Signature {
        let mut sig = Signature::new(call_conv);
        for param in &self.params {
            sig.params.extend(param.to_abi_params(pointer_type));
        }
        sig.returns.extend(self.ret.to_abi_params(pointer_type));
        sig
    }
}

impl fmt::Display for NativeFunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ")")
    }
}
