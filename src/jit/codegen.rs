//! Cranelift IR Generation Helpers
//!
//! [`CodegenContext`] wraps a `FunctionBuilder` while a wasm function body is
//! lowered: it tracks the operand stack as SSA values, holds locals, and
//! knows where the current context pointer lives so that context-switching
//! calls can replace it.

use cranelift::codegen::ir::{MemFlags, SourceLoc, Type, Value};
use cranelift::prelude::InstBuilder;
use cranelift_frontend::FunctionBuilder;
use smallvec::SmallVec;

use super::literals::Constant;
use super::lowering::lower_type;
use super::types::{JitError, JitResult};
use crate::ir::ValueType;
use crate::runtime::{ContextRuntimeData, MAX_THUNK_ARG_AND_RETURN_BYTES, VALUE_SLOT_BYTES};

/// Values popped for a call or return
pub type ValueList = SmallVec<[Value; 4]>;

/// Code generation context wrapping a Cranelift FunctionBuilder
///
/// Provides:
/// - Operand stack manipulation (push/pop/peek)
/// - Locals as SSA values
/// - Constant materialization
/// - Access to the context's argument/return area
pub struct CodegenContext<'a, 'b> {
    pub builder: &'a mut FunctionBuilder<'b>,

    /// Current context pointer; replaced by context-switching calls
    ctx_ptr: Value,

    pointer_type: Type,

    /// Operand stack (SSA values, never memory)
    value_stack: Vec<Value>,

    /// Flag indicating if current block is terminated
    terminated: bool,

    locals: Vec<Value>,
}

impl<'a, 'b> CodegenContext<'a, 'b> {
    pub fn new(builder: &'a mut FunctionBuilder<'b>, ctx_ptr: Value, pointer_type: Type) -> Self {
        CodegenContext {
            builder,
            ctx_ptr,
            pointer_type,
            value_stack: Vec::with_capacity(16),
            terminated: false,
            locals: Vec::new(),
        }
    }

    // =========================================================================
    // Stack Operations
    // =========================================================================

    pub fn push(&mut self, val: Value) {
        self.value_stack.push(val);
    }

    pub fn pop(&mut self) -> JitResult<Value> {
        self.value_stack.pop().ok_or(JitError::StackUnderflow)
    }

    pub fn peek(&self) -> JitResult<Value> {
        self.value_stack
            .last()
            .copied()
            .ok_or(JitError::StackUnderflow)
    }

    /// Pop `count` values, returned in push order
    pub fn pop_n(&mut self, count: usize) -> JitResult<ValueList> {
        let depth = self.value_stack.len();
        if count > depth {
            return Err(JitError::StackUnderflow);
        }
        Ok(self.value_stack.drain(depth - count..).collect())
    }

    pub fn stack_depth(&self) -> usize {
        self.value_stack.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn mark_terminated(&mut self) {
        self.terminated = true;
    }

    pub fn ctx_ptr(&self) -> Value {
        self.ctx_ptr
    }

    /// Adopt the context returned by a callee
    pub fn set_ctx_ptr(&mut self, ctx_ptr: Value) {
        self.ctx_ptr = ctx_ptr;
    }

    pub fn pointer_type(&self) -> Type {
        self.pointer_type
    }

    /// Attribute the instructions that follow to operation `op_index`
    pub fn set_op_index(&mut self, op_index: usize) {
        self.builder.set_srcloc(SourceLoc::new(op_index as u32));
    }

    // =========================================================================
    // Local Variable Operations
    // =========================================================================

    /// Initialize locals: parameters first, then zeroed declared locals
    pub fn init_locals(&mut self, params: &[Value], declared: &[ValueType]) {
        self.locals = params.to_vec();
        for ty in declared {
            let zero = super::lowering::zero_constant(*ty).emit(self.builder, self.pointer_type);
            self.locals.push(zero);
        }
    }

    pub fn load_local(&mut self, index: u32) -> JitResult<()> {
        let value = *self.local(index)?;
        self.push(value);
        Ok(())
    }

    pub fn store_local(&mut self, index: u32) -> JitResult<()> {
        let value = self.pop()?;
        *self.local(index)? = value;
        Ok(())
    }

    /// Store without popping
    pub fn tee_local(&mut self, index: u32) -> JitResult<()> {
        let value = self.peek()?;
        *self.local(index)? = value;
        Ok(())
    }

    fn local(&mut self, index: u32) -> JitResult<&mut Value> {
        let count = self.locals.len();
        self.locals.get_mut(index as usize).ok_or_else(|| {
            JitError::InvalidModule(format!("local {} out of range ({} locals)", index, count))
        })
    }

    // =========================================================================
    // Constants and arithmetic
    // =========================================================================

    pub fn push_constant(&mut self, constant: Constant) {
        let value = constant.emit(self.builder, self.pointer_type);
        self.push(value);
    }

    /// Pop two operands, push `op(lhs, rhs)`
    pub fn binary(
        &mut self,
        op: impl FnOnce(&mut FunctionBuilder<'b>, Value, Value) -> Value,
    ) -> JitResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = op(self.builder, lhs, rhs);
        self.push(result);
        Ok(())
    }

    // =========================================================================
    // Return area
    // =========================================================================

    /// Byte offset of result slot `index` from the context pointer
    pub fn return_slot_offset(index: usize) -> JitResult<i32> {
        let end = (index + 1) * VALUE_SLOT_BYTES;
        if end > MAX_THUNK_ARG_AND_RETURN_BYTES {
            return Err(JitError::InvalidModule(format!(
                "result {} does not fit in the {}-byte return area",
                index, MAX_THUNK_ARG_AND_RETURN_BYTES
            )));
        }
        Ok((ContextRuntimeData::RETURN_AREA_OFFSET + index * VALUE_SLOT_BYTES) as i32)
    }

    /// Store `values` to consecutive slots of the current context's return area
    pub fn store_return_area(&mut self, values: &[Value]) -> JitResult<()> {
        for (i, value) in values.iter().enumerate() {
            let offset = Self::return_slot_offset(i)?;
            self.builder
                .ins()
                .store(MemFlags::trusted(), *value, self.ctx_ptr, offset);
        }
        Ok(())
    }

    /// Load values of `types` from the current context's return area
    pub fn load_return_area(&mut self, types: &[ValueType]) -> JitResult<ValueList> {
        let mut values = ValueList::new();
        for (i, ty) in types.iter().enumerate() {
            let offset = Self::return_slot_offset(i)?;
            let native = self.scalar_type(*ty)?;
            values.push(
                self.builder
                    .ins()
                    .load(native, MemFlags::trusted(), self.ctx_ptr, offset),
            );
        }
        Ok(values)
    }

    /// Cranelift type of a wasm value
    pub fn scalar_type(&self, ty: ValueType) -> JitResult<Type> {
        lower_type(ty).as_scalar(self.pointer_type).ok_or_else(|| {
            JitError::CompilationError(format!("{} does not lower to a scalar", ty))
        })
    }
}
