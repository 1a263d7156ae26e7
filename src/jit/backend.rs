//! Code Generation Backend
//!
//! [`CodegenBackend`] owns the target ISA and the reusable Cranelift builder
//! state. One backend is created per engine and shared by every compilation;
//! emission and object production are serialized by its lock.

use std::time::Instant;

use cranelift::codegen::isa::OwnedTargetIsa;
use cranelift::codegen::settings::{self, Configurable};
use cranelift_frontend::FunctionBuilderContext;
use cranelift_object::object::write::StandardSegment;
use cranelift_object::object::SectionKind;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::config::BackendConfig;
use super::emit::{self, NativeModule};
use super::op_map::{encode_op_maps, OP_MAP_SECTION_NAME};
use super::types::{JitError, JitResult};
use super::unwind::{UnwindTableBuilder, PDATA_SECTION_NAME, XDATA_SECTION_NAME};
use crate::ir::{FunctionType, IrModule};

/// Native code generator for the host
pub struct CodegenBackend {
    isa: OwnedTargetIsa,
    config: BackendConfig,
    /// Builder scratch state, reused across functions
    state: Mutex<FunctionBuilderContext>,
}

impl CodegenBackend {
    /// Create a backend targeting the host ISA
    pub fn new(config: BackendConfig) -> JitResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", config.opt_level.as_setting())
            .map_err(|e| JitError::CompilationError(format!("Failed to set opt_level: {}", e)))?;
        // Units are loaded at arbitrary addresses by our own loader
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| JitError::CompilationError(format!("Failed to set is_pic: {}", e)))?;
        flag_builder
            .set("enable_verifier", if config.verify { "true" } else { "false" })
            .map_err(|e| {
                JitError::CompilationError(format!("Failed to set enable_verifier: {}", e))
            })?;

        let isa_builder = cranelift_native::builder().map_err(|e| {
            JitError::CompilationError(format!("Failed to create ISA builder: {}", e))
        })?;

        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::CompilationError(format!("Failed to create ISA: {}", e)))?;

        debug!(
            target: "wasmjit::jit::backend",
            triple = %isa.triple(),
            opt_level = config.opt_level.as_setting(),
            verify = config.verify,
            "Created code generation backend"
        );

        Ok(CodegenBackend {
            isa,
            config,
            state: Mutex::new(FunctionBuilderContext::new()),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn isa(&self) -> &OwnedTargetIsa {
        &self.isa
    }

    /// Lower a validated module; see [`emit::emit_module`]
    pub fn emit_module(&self, ir: &IrModule, name: &str) -> JitResult<NativeModule> {
        let mut fb_ctx = self.state.lock();
        emit::emit_module(&self.isa, &mut fb_ctx, ir, name, self.config.log_metrics)
    }

    /// Build the invoke thunk for `function_type`
    pub fn emit_invoke_thunk(&self, function_type: &FunctionType) -> JitResult<NativeModule> {
        let mut fb_ctx = self.state.lock();
        emit::emit_invoke_thunk(&self.isa, &mut fb_ctx, function_type)
    }

    /// Produce relocatable object bytes for `module`
    ///
    /// The object carries the op-index section and, on Windows hosts, the
    /// section-relative `.pdata`/`.xdata` tables the loader rebases.
    pub fn compile_module(&self, module: NativeModule, log_metrics: bool) -> JitResult<Vec<u8>> {
        let _guard = self.state.lock();
        let start = Instant::now();
        let name = module.name().to_string();
        let (object_module, functions) = module.into_parts();

        let mut product = object_module.finish();
        let data_segment = product.object.segment_name(StandardSegment::Data).to_vec();

        let op_maps: Vec<_> = functions
            .iter()
            .map(|f| (f.symbol.clone(), f.op_map.clone()))
            .collect();
        let op_map_section = product.object.add_section(
            data_segment.clone(),
            OP_MAP_SECTION_NAME.as_bytes().to_vec(),
            SectionKind::Other,
        );
        product
            .object
            .append_section_data(op_map_section, &encode_op_maps(&op_maps), 4);

        let mut unwind_tables = UnwindTableBuilder::new();
        for function in &functions {
            if let Some(unwind_info) = &function.unwind_info {
                let symbol = product.object.symbol(product.function_symbol(function.id));
                let offset = u32::try_from(symbol.value).map_err(|_| {
                    JitError::CompilationError(format!("{} is beyond 4GB of .text", function.symbol))
                })?;
                unwind_tables.add_function(offset, function.code_size, unwind_info);
            }
        }
        if !unwind_tables.is_empty() {
            let (pdata, xdata) = unwind_tables.finish();
            for (section_name, contents) in [(PDATA_SECTION_NAME, pdata), (XDATA_SECTION_NAME, xdata)] {
                let section = product.object.add_section(
                    data_segment.clone(),
                    section_name.as_bytes().to_vec(),
                    SectionKind::ReadOnlyData,
                );
                product.object.append_section_data(section, &contents, 4);
            }
        }

        let bytes = product
            .emit()
            .map_err(|e| JitError::CompilationError(format!("Failed to emit object: {}", e)))?;

        if log_metrics {
            let code_bytes: u64 = functions.iter().map(|f| u64::from(f.code_size)).sum();
            info!(
                target: "wasmjit::jit::backend",
                module = %name,
                functions = functions.len(),
                code_bytes,
                object_bytes = bytes.len(),
                elapsed_us = start.elapsed().as_micros() as u64,
                "Compiled module"
            );
        }
        Ok(bytes)
    }

    /// Emit and compile `ir` in one step
    pub fn compile(&self, ir: &IrModule, name: &str) -> JitResult<Vec<u8>> {
        let module = self.emit_module(ir, name)?;
        self.compile_module(module, self.config.log_metrics)
    }

    /// Emit and compile the invoke thunk for `function_type`
    pub fn compile_invoke_thunk(&self, function_type: &FunctionType) -> JitResult<Vec<u8>> {
        let module = self.emit_invoke_thunk(function_type)?;
        self.compile_module(module, self.config.log_metrics)
    }
}

impl std::fmt::Debug for CodegenBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodegenBackend")
            .field("triple", &self.isa.triple().to_string())
            .field("config", &self.config)
            .finish()
    }
}
