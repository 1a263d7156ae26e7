//! Module and Invoke Thunk Emission
//!
//! Lowers an [`IrModule`] into a Cranelift object module:
//!
//! - import `i` is declared as `functionImport<i>` in its own convention
//! - definition `i` is declared and exported as `functionDef<i>` in the wasm
//!   convention
//! - every operation sets the source location to its index, which becomes
//!   the per-function [`OffsetToOpIndexMap`]
//!
//! Invoke thunks are the host's entry point into wasm code. A thunk for type
//! `T` is a C-convention function `(callee, ctx, args, results) -> ctx` that
//! reads arguments from 16-byte slots, calls `callee` with the wasm
//! convention and writes results to 16-byte slots.

use std::time::Instant;

use cranelift::codegen::ir::{AbiParam, MemFlags, Signature, TrapCode, Type, UserFuncName, Value};
use cranelift::codegen::isa::unwind::UnwindInfo;
use cranelift::codegen::isa::OwnedTargetIsa;
use cranelift::codegen::Context;
use cranelift::prelude::InstBuilder;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use tracing::{debug, info, trace};

use super::calling_conv::native_signature;
use super::codegen::{CodegenContext, ValueList};
use super::literals::{
    emit_literal, memory_base_offset, memory_index_from_base_offset, table_base_offset,
    table_index_from_base_offset,
};
use super::lowering::results_returned_directly;
use super::naming::{external_name_of, import_name_of, invoke_thunk_name};
use super::op_map::OffsetToOpIndexMap;
use super::types::{JitError, JitResult};
use super::unwind::ExceptionTableStrategy;
use crate::ir::{FunctionDef, FunctionType, IrModule, Operator, TypeTuple};
use crate::runtime::{CallingConvention, VALUE_SLOT_BYTES};

/// One function defined in a [`NativeModule`]
#[derive(Debug)]
pub(crate) struct DefinedFunction {
    pub symbol: String,
    pub id: FuncId,
    pub code_size: u32,
    pub op_map: OffsetToOpIndexMap,
    /// Win64 `UNWIND_INFO`, when the host uses Windows exception tables
    pub unwind_info: Option<Vec<u8>>,
}

/// A lowered module ready for `compile_module`
pub struct NativeModule {
    name: String,
    module: ObjectModule,
    functions: Vec<DefinedFunction>,
}

impl NativeModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// Names of the defined symbols in definition order
    pub fn symbol_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.symbol.as_str())
    }

    pub fn op_map(&self, symbol: &str) -> Option<&OffsetToOpIndexMap> {
        self.functions
            .iter()
            .find(|f| f.symbol == symbol)
            .map(|f| &f.op_map)
    }

    pub(crate) fn into_parts(self) -> (ObjectModule, Vec<DefinedFunction>) {
        (self.module, self.functions)
    }
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("functions", &self.functions)
            .finish()
    }
}

/// How generated code calls function index `i`
#[derive(Debug, Clone)]
struct Callee {
    id: FuncId,
    ty: FunctionType,
    convention: CallingConvention,
    memory_index: usize,
    table_index: usize,
}

/// Shared declare/define loop for module and thunk emission
struct ObjectEmitter<'f> {
    isa: OwnedTargetIsa,
    module: ObjectModule,
    fb_ctx: &'f mut FunctionBuilderContext,
    ctx: Context,
    functions: Vec<DefinedFunction>,
    name: String,
}

impl<'f> ObjectEmitter<'f> {
    fn new(isa: &OwnedTargetIsa, name: &str, fb_ctx: &'f mut FunctionBuilderContext) -> JitResult<Self> {
        let builder = ObjectBuilder::new(isa.clone(), name, default_libcall_names()).map_err(|e| {
            JitError::CompilationError(format!("Failed to create object builder: {}", e))
        })?;
        let module = ObjectModule::new(builder);
        let ctx = module.make_context();
        Ok(ObjectEmitter {
            isa: isa.clone(),
            module,
            fb_ctx,
            ctx,
            functions: Vec::new(),
            name: name.to_string(),
        })
    }

    fn declare(&mut self, name: &str, linkage: Linkage, signature: &Signature) -> JitResult<FuncId> {
        self.module
            .declare_function(name, linkage, signature)
            .map_err(|e| JitError::CompilationError(format!("Failed to declare {}: {}", name, e)))
    }

    /// Build, compile and record the body of `id`
    fn define(
        &mut self,
        id: FuncId,
        symbol: String,
        build: impl FnOnce(&mut FunctionBuilder, &mut ObjectModule) -> JitResult<()>,
    ) -> JitResult<()> {
        self.ctx.func.signature = self
            .module
            .declarations()
            .get_function_decl(id)
            .signature
            .clone();
        self.ctx.func.name = UserFuncName::user(0, id.as_u32());

        let built = {
            let mut builder = FunctionBuilder::new(&mut self.ctx.func, self.fb_ctx);
            let built = build(&mut builder, &mut self.module);
            if built.is_ok() {
                builder.finalize();
            }
            built
        };
        if let Err(e) = built {
            // An unfinished builder leaves its context dirty
            *self.fb_ctx = FunctionBuilderContext::new();
            self.module.clear_context(&mut self.ctx);
            return Err(e);
        }

        trace!(target: "wasmjit::jit::emit::ir", symbol = %symbol, ir = %self.ctx.func.display(), "Generated IR");

        self.module
            .define_function(id, &mut self.ctx)
            .map_err(|e| JitError::CompilationError(format!("Failed to define {}: {:?}", symbol, e)))?;

        let compiled = self.ctx.compiled_code().ok_or_else(|| {
            JitError::CompilationError(format!("No compiled code for {}", symbol))
        })?;
        let op_map: OffsetToOpIndexMap = compiled
            .buffer
            .get_srclocs_sorted()
            .iter()
            .filter(|srcloc| !srcloc.loc.is_default())
            .map(|srcloc| (srcloc.start, srcloc.loc.bits()))
            .collect();
        let code_size = compiled.code_buffer().len() as u32;

        let unwind_info = if ExceptionTableStrategy::host().is_supported() {
            match compiled.create_unwind_info(&*self.isa) {
                Ok(Some(UnwindInfo::WindowsX64(info))) => {
                    let mut bytes = vec![0u8; info.emit_size()];
                    info.emit(&mut bytes);
                    Some(bytes)
                }
                Ok(_) => None,
                Err(e) => {
                    return Err(JitError::CompilationError(format!(
                        "Failed to create unwind info for {}: {}",
                        symbol, e
                    )))
                }
            }
        } else {
            None
        };

        debug!(
            target: "wasmjit::jit::emit",
            symbol = %symbol,
            code_size,
            op_entries = op_map.len(),
            "Defined function"
        );

        self.functions.push(DefinedFunction {
            symbol,
            id,
            code_size,
            op_map,
            unwind_info,
        });
        self.module.clear_context(&mut self.ctx);
        Ok(())
    }

    fn finish(self) -> NativeModule {
        NativeModule {
            name: self.name,
            module: self.module,
            functions: self.functions,
        }
    }
}

// =============================================================================
// Module emission
// =============================================================================

/// Lower `ir` into a Cranelift object module named `name`
pub fn emit_module(
    isa: &OwnedTargetIsa,
    fb_ctx: &mut FunctionBuilderContext,
    ir: &IrModule,
    name: &str,
    log_metrics: bool,
) -> JitResult<NativeModule> {
    let start = Instant::now();
    ir.validate_shape()?;

    let mut emitter = ObjectEmitter::new(isa, name, fb_ctx)?;
    let pointer_type = isa.pointer_type();
    let mut callees = Vec::with_capacity(ir.num_functions());

    for (i, import) in ir.imports.iter().enumerate() {
        let signature = native_signature(&import.ty, import.calling_convention, &**isa)?;
        let id = emitter.declare(&import_name_of(i), Linkage::Import, &signature)?;
        callees.push(Callee {
            id,
            ty: import.ty.clone(),
            convention: import.calling_convention,
            memory_index: import.memory_index,
            table_index: import.table_index,
        });
    }

    for (i, def) in ir.functions.iter().enumerate() {
        let signature = native_signature(&def.ty, CallingConvention::Wasm, &**isa)?;
        let id = emitter.declare(&external_name_of(i), Linkage::Export, &signature)?;
        callees.push(Callee {
            id,
            ty: def.ty.clone(),
            convention: CallingConvention::Wasm,
            memory_index: 0,
            table_index: 0,
        });
    }

    let first_def = ir.imports.len();
    for (i, def) in ir.functions.iter().enumerate() {
        let id = callees[first_def + i].id;
        emitter.define(id, external_name_of(i), |builder, module| {
            lower_function(builder, module, def, &callees, pointer_type)
        })?;
    }

    if log_metrics {
        info!(
            target: "wasmjit::jit::emit",
            module = name,
            imports = ir.imports.len(),
            functions = ir.functions.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Emitted module"
        );
    }
    Ok(emitter.finish())
}

fn lower_function(
    builder: &mut FunctionBuilder,
    module: &mut ObjectModule,
    def: &FunctionDef,
    callees: &[Callee],
    pointer_type: Type,
) -> JitResult<()> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);
    let params = builder.block_params(entry).to_vec();
    let (&ctx_ptr, wasm_params) = params
        .split_first()
        .ok_or_else(|| JitError::CompilationError("wasm function without context".to_string()))?;

    let mut cg = CodegenContext::new(builder, ctx_ptr, pointer_type);
    cg.init_locals(wasm_params, &def.locals);

    for (op_index, op) in def.body.iter().enumerate() {
        cg.set_op_index(op_index);
        lower_operator(&mut cg, module, callees, op)?;
        if cg.is_terminated() {
            return Ok(());
        }
    }

    cg.set_op_index(def.body.len());
    let results = cg.pop_n(def.ty.results().len())?;
    emit_wasm_return(&mut cg, &results, def.ty.results())
}

fn emit_wasm_return(cg: &mut CodegenContext, results: &[Value], result_types: &TypeTuple) -> JitResult<()> {
    let ctx_ptr = cg.ctx_ptr();
    if results_returned_directly(result_types) {
        let mut values = ValueList::new();
        values.push(ctx_ptr);
        values.extend_from_slice(results);
        cg.builder.ins().return_(&values);
    } else {
        cg.store_return_area(results)?;
        cg.builder.ins().return_(&[ctx_ptr]);
    }
    cg.mark_terminated();
    Ok(())
}

fn lower_operator(
    cg: &mut CodegenContext,
    module: &mut ObjectModule,
    callees: &[Callee],
    op: &Operator,
) -> JitResult<()> {
    match *op {
        Operator::I32Const(v) => cg.push_constant(emit_literal(v)),
        Operator::I64Const(v) => cg.push_constant(emit_literal(v)),
        Operator::F32Const(v) => cg.push_constant(emit_literal(v)),
        Operator::F64Const(v) => cg.push_constant(emit_literal(v)),
        Operator::V128Const(v) => cg.push_constant(emit_literal(v)),

        Operator::LocalGet(i) => cg.load_local(i)?,
        Operator::LocalSet(i) => cg.store_local(i)?,
        Operator::LocalTee(i) => cg.tee_local(i)?,

        Operator::I32Add | Operator::I64Add => cg.binary(|b, x, y| b.ins().iadd(x, y))?,
        Operator::I32Sub | Operator::I64Sub => cg.binary(|b, x, y| b.ins().isub(x, y))?,
        Operator::I32Mul | Operator::I64Mul => cg.binary(|b, x, y| b.ins().imul(x, y))?,
        // udiv traps on a zero divisor
        Operator::I32DivU => cg.binary(|b, x, y| b.ins().udiv(x, y))?,
        Operator::F32Add | Operator::F64Add => cg.binary(|b, x, y| b.ins().fadd(x, y))?,
        Operator::F32Mul | Operator::F64Mul => cg.binary(|b, x, y| b.ins().fmul(x, y))?,

        Operator::Call(function_index) => {
            let callee = callees.get(function_index as usize).ok_or_else(|| {
                JitError::InvalidModule(format!("call to unknown function {}", function_index))
            })?;
            lower_call(cg, module, callee)?;
        }
        Operator::Drop => {
            cg.pop()?;
        }
        Operator::Unreachable => {
            cg.builder.ins().trap(TrapCode::unwrap_user(1));
            cg.mark_terminated();
        }
    }
    Ok(())
}

fn lower_call(cg: &mut CodegenContext, module: &mut ObjectModule, callee: &Callee) -> JitResult<()> {
    let func_ref = module.declare_func_in_func(callee.id, cg.builder.func);
    let args = cg.pop_n(callee.ty.params().len())?;

    let mut call_args = ValueList::new();
    match callee.convention {
        CallingConvention::C => {}
        CallingConvention::IntrinsicWithMemAndTable => {
            let memory_id = memory_index_from_base_offset(memory_base_offset(callee.memory_index))?;
            let table_id = table_index_from_base_offset(table_base_offset(callee.table_index))?;
            let pointer_type = cg.pointer_type();
            call_args.push(cg.ctx_ptr());
            call_args.push(memory_id.emit(cg.builder, pointer_type));
            call_args.push(table_id.emit(cg.builder, pointer_type));
        }
        CallingConvention::Wasm
        | CallingConvention::Intrinsic
        | CallingConvention::IntrinsicWithContextSwitch => call_args.push(cg.ctx_ptr()),
    }
    call_args.extend_from_slice(&args);

    let call = cg.builder.ins().call(func_ref, &call_args);
    let returned: ValueList = cg.builder.inst_results(call).iter().copied().collect();
    let results = callee.ty.results();

    match callee.convention {
        CallingConvention::Wasm | CallingConvention::IntrinsicWithContextSwitch => {
            let new_ctx = returned.first().copied().ok_or_else(|| {
                JitError::CompilationError(format!("{} call returned no context", callee.convention))
            })?;
            cg.set_ctx_ptr(new_ctx);
            if callee.convention == CallingConvention::Wasm && results_returned_directly(results) {
                for value in &returned[1..] {
                    cg.push(*value);
                }
            } else {
                for value in cg.load_return_area(results.as_slice())? {
                    cg.push(value);
                }
            }
        }
        CallingConvention::Intrinsic
        | CallingConvention::IntrinsicWithMemAndTable
        | CallingConvention::C => {
            for value in returned {
                cg.push(value);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Invoke thunks
// =============================================================================

/// Emit the invoke thunk for `function_type` into its own object module
pub fn emit_invoke_thunk(
    isa: &OwnedTargetIsa,
    fb_ctx: &mut FunctionBuilderContext,
    function_type: &FunctionType,
) -> JitResult<NativeModule> {
    let name = invoke_thunk_name(function_type);
    let pointer_type = isa.pointer_type();
    let callee_signature = native_signature(function_type, CallingConvention::Wasm, &**isa)?;

    let mut signature = Signature::new(isa.default_call_conv());
    for _ in 0..4 {
        signature.params.push(AbiParam::new(pointer_type));
    }
    signature.returns.push(AbiParam::new(pointer_type));

    let mut emitter = ObjectEmitter::new(isa, &name, fb_ctx)?;
    let id = emitter.declare(&name, Linkage::Export, &signature)?;
    emitter.define(id, name.clone(), |builder, _module| {
        lower_invoke_thunk(builder, function_type, callee_signature, pointer_type)
    })?;
    Ok(emitter.finish())
}

fn lower_invoke_thunk(
    builder: &mut FunctionBuilder,
    function_type: &FunctionType,
    callee_signature: Signature,
    pointer_type: Type,
) -> JitResult<()> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);
    let &[callee, ctx_ptr, args_ptr, results_ptr] = builder.block_params(entry) else {
        return Err(JitError::CompilationError(
            "invoke thunk expects four parameters".to_string(),
        ));
    };

    // Caller buffers carry no alignment guarantee
    let slot_flags = MemFlags::new().with_notrap();
    let signature_ref = builder.import_signature(callee_signature);
    let mut cg = CodegenContext::new(builder, ctx_ptr, pointer_type);

    let mut call_args = ValueList::new();
    call_args.push(ctx_ptr);
    for (i, ty) in function_type.params().iter().enumerate() {
        let native = cg.scalar_type(*ty)?;
        let offset = (i * VALUE_SLOT_BYTES) as i32;
        call_args.push(cg.builder.ins().load(native, slot_flags, args_ptr, offset));
    }

    let call = cg.builder.ins().call_indirect(signature_ref, callee, &call_args);
    let returned: ValueList = cg.builder.inst_results(call).iter().copied().collect();
    let new_ctx = returned.first().copied().ok_or_else(|| {
        JitError::CompilationError("wasm call returned no context".to_string())
    })?;
    cg.set_ctx_ptr(new_ctx);

    let results = function_type.results();
    let values: ValueList = if results_returned_directly(results) {
        returned[1..].iter().copied().collect()
    } else {
        cg.load_return_area(results.as_slice())?
    };
    for (i, value) in values.iter().enumerate() {
        let offset = (i * VALUE_SLOT_BYTES) as i32;
        cg.builder.ins().store(slot_flags, *value, results_ptr, offset);
    }

    cg.builder.ins().return_(&[new_ctx]);
    cg.mark_terminated();
    Ok(())
}
