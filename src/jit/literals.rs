//! Literal and Address Constant Emission
//!
//! Compile-time constants are built as pure [`Constant`] values first and
//! materialized into Cranelift IR with [`Constant::emit`]. The index helpers
//! recover "memory #k" / "table #k" from a constant offset into
//! [`CompartmentRuntimeData`]'s base-address arrays so generated code can
//! pass the index without recomputing it at execution time.

use cranelift::codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift::codegen::ir::{types, ConstantData, InstBuilder, Type, Value};
use cranelift_frontend::FunctionBuilder;

use super::types::{JitError, JitResult, NativeType, PointeeKind};
use crate::ir::V128;
use crate::runtime::CompartmentRuntimeData;

/// A compile-time constant of a native type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    I32(u32),
    I64(u64),
    /// IEEE bits of an f32
    F32(u32),
    /// IEEE bits of an f64
    F64(u64),
    Bool(bool),
    V128(V128),
    /// Null reference of the given pointee kind
    Null(PointeeKind),
}

impl Constant {
    /// Encode a raw pointer as a host-width integer
    pub fn pointer<T>(pointer: *const T) -> Constant {
        Constant::from_usize(pointer as usize)
    }

    /// Encode a host-width integer (32 or 64 bits by host address width)
    pub fn from_usize(value: usize) -> Constant {
        if usize::BITS == 64 {
            Constant::I64(value as u64)
        } else {
            Constant::I32(value as u32)
        }
    }

    /// Native type of this constant
    pub fn native_type(&self) -> NativeType {
        match self {
            Constant::I32(_) => NativeType::Scalar(types::I32),
            Constant::I64(_) => NativeType::Scalar(types::I64),
            Constant::F32(_) => NativeType::Scalar(types::F32),
            Constant::F64(_) => NativeType::Scalar(types::F64),
            Constant::Bool(_) => NativeType::Scalar(types::I8),
            Constant::V128(_) => NativeType::Scalar(types::I64X2),
            Constant::Null(kind) => NativeType::Pointer(*kind),
        }
    }

    /// Integer value of an integer constant
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Constant::I32(v) => Some(u64::from(v)),
            Constant::I64(v) => Some(v),
            Constant::Bool(b) => Some(u64::from(b)),
            _ => None,
        }
    }

    /// Materialize this constant at the builder's current position
    pub fn emit(&self, builder: &mut FunctionBuilder, pointer_type: Type) -> Value {
        match *self {
            // Narrow immediates are zero-extended to 64 bits
            Constant::I32(v) => builder.ins().iconst(types::I32, i64::from(v)),
            Constant::I64(v) => builder.ins().iconst(types::I64, v as i64),
            Constant::F32(bits) => builder.ins().f32const(Ieee32::with_bits(bits)),
            Constant::F64(bits) => builder.ins().f64const(Ieee64::with_bits(bits)),
            Constant::Bool(b) => builder.ins().iconst(types::I8, i64::from(b)),
            Constant::V128(v) => {
                let bytes = v.to_le_bytes();
                let handle = builder
                    .func
                    .dfg
                    .constants
                    .insert(ConstantData::from(&bytes[..]));
                builder.ins().vconst(types::I64X2, handle)
            }
            Constant::Null(_) => builder.ins().iconst(pointer_type, 0),
        }
    }
}

/// Values that have a literal constant form
pub trait Literal {
    fn literal(self) -> Constant;
}

impl Literal for u32 {
    fn literal(self) -> Constant {
        Constant::I32(self)
    }
}

impl Literal for i32 {
    fn literal(self) -> Constant {
        Constant::I32(self as u32)
    }
}

impl Literal for u64 {
    fn literal(self) -> Constant {
        Constant::I64(self)
    }
}

impl Literal for i64 {
    fn literal(self) -> Constant {
        Constant::I64(self as u64)
    }
}

impl Literal for f32 {
    fn literal(self) -> Constant {
        Constant::F32(self.to_bits())
    }
}

impl Literal for f64 {
    fn literal(self) -> Constant {
        Constant::F64(self.to_bits())
    }
}

impl Literal for bool {
    fn literal(self) -> Constant {
        Constant::Bool(self)
    }
}

impl Literal for V128 {
    fn literal(self) -> Constant {
        Constant::V128(self)
    }
}

/// Build a constant from any literal value
pub fn emit_literal<T: Literal>(value: T) -> Constant {
    value.literal()
}

// =============================================================================
// Base-address offsets
// =============================================================================

/// Offset of memory `k`'s base address in `CompartmentRuntimeData`
pub fn memory_base_offset(memory_index: usize) -> Constant {
    Constant::from_usize(
        CompartmentRuntimeData::MEMORY_BASES_OFFSET
            + memory_index * CompartmentRuntimeData::POINTER_SIZE,
    )
}

/// Offset of table `k`'s base address in `CompartmentRuntimeData`
pub fn table_base_offset(table_index: usize) -> Constant {
    Constant::from_usize(
        CompartmentRuntimeData::TABLE_BASES_OFFSET
            + table_index * CompartmentRuntimeData::POINTER_SIZE,
    )
}

/// Recover `k` from `memory_bases_offset + k * pointer_size`
pub fn memory_index_from_base_offset(offset: Constant) -> JitResult<Constant> {
    index_from_base_offset(
        offset,
        CompartmentRuntimeData::MEMORY_BASES_OFFSET,
        "memory_bases",
    )
}

/// Recover `k` from `table_bases_offset + k * pointer_size`
pub fn table_index_from_base_offset(offset: Constant) -> JitResult<Constant> {
    index_from_base_offset(
        offset,
        CompartmentRuntimeData::TABLE_BASES_OFFSET,
        "table_bases",
    )
}

/// Exact subtraction, then exact division by the pointer size
fn index_from_base_offset(
    offset: Constant,
    field_offset: usize,
    field: &'static str,
) -> JitResult<Constant> {
    let raw = offset.as_u64().ok_or(JitError::InexactBaseOffset { field, offset: 0 })?;
    let inexact = JitError::InexactBaseOffset { field, offset: raw };

    let relative = raw.checked_sub(field_offset as u64).ok_or(inexact.clone())?;
    let pointer_size = CompartmentRuntimeData::POINTER_SIZE as u64;
    if relative % pointer_size != 0 {
        return Err(inexact);
    }
    Ok(Constant::I64(relative / pointer_size))
}
