//! Test utilities for the code generation pipeline
//!
//! This module provides shared helpers for integration tests:
//! - Tracing output for failing tests
//! - Compiling and loading module and invoke-thunk units
//! - Calling compiled code through an invoke thunk with 16-byte value slots

#![allow(dead_code)]

use std::sync::{Arc, Once};

use wasmjit::ir::{FunctionType, IrModule};
use wasmjit::jit::unwind::SEH_HANDLER_SYMBOL;
use wasmjit::jit::{BackendConfig, CodegenBackend, ImportedSymbolMap, JitUnit, UnitKind};
use wasmjit::runtime::{ContextRuntimeData, FunctionInstance, VALUE_SLOT_BYTES};

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn backend() -> CodegenBackend {
    init_tracing();
    CodegenBackend::new(BackendConfig::default().with_verify(true).with_log_metrics(true))
        .expect("Failed to create backend")
}

extern "C" fn seh_handler() {}

/// `imports` plus the exception handler units with Win64 tables require
pub fn with_seh_handler(imports: &ImportedSymbolMap) -> ImportedSymbolMap {
    let mut imports = imports.clone();
    imports.insert(SEH_HANDLER_SYMBOL.to_string(), seh_handler as usize);
    imports
}

/// Function instances for every definition of `module`
pub fn instances(module: &IrModule) -> Vec<Arc<FunctionInstance>> {
    module
        .functions
        .iter()
        .enumerate()
        .map(|(i, def)| Arc::new(FunctionInstance::new(i, def.debug_name.clone(), def.ty.clone())))
        .collect()
}

/// Compile `module` and load it against `imports`
pub fn load_module(backend: &CodegenBackend, module: &IrModule, imports: &ImportedSymbolMap) -> JitUnit {
    let bytes = backend.compile(module, "test").expect("Failed to compile module");
    let unit = JitUnit::new(UnitKind::Module {
        functions: instances(module),
    });
    unit.load(&bytes, &with_seh_handler(imports), true)
        .expect("Failed to load module");
    unit
}

pub fn load_thunk(backend: &CodegenBackend, function_type: &FunctionType) -> JitUnit {
    let bytes = backend
        .compile_invoke_thunk(function_type)
        .expect("Failed to compile invoke thunk");
    let unit = JitUnit::new(UnitKind::InvokeThunk {
        function_type: function_type.clone(),
    });
    unit.load(&bytes, &with_seh_handler(&ImportedSymbolMap::new()), true)
        .expect("Failed to load invoke thunk");
    unit
}

/// One argument or result slot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C, align(16))]
pub struct Slot(pub [u8; VALUE_SLOT_BYTES]);

impl Slot {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut slot = Slot::default();
        slot.0[..bytes.len()].copy_from_slice(bytes);
        slot
    }

    pub fn i32(value: i32) -> Self {
        Self::from_bytes(&value.to_ne_bytes())
    }

    pub fn i64(value: i64) -> Self {
        Self::from_bytes(&value.to_ne_bytes())
    }

    pub fn f64(value: f64) -> Self {
        Self::from_bytes(&value.to_ne_bytes())
    }

    pub fn as_i32(&self) -> i32 {
        i32::from_ne_bytes(self.0[..4].try_into().unwrap())
    }

    pub fn as_i64(&self) -> i64 {
        i64::from_ne_bytes(self.0[..8].try_into().unwrap())
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_ne_bytes(self.0[..8].try_into().unwrap())
    }
}

type InvokeThunk = unsafe extern "C" fn(*const u8, *mut u8, *const Slot, *mut Slot) -> *mut u8;

/// Result of one call through a thunk
pub struct Invocation {
    pub results: Vec<Slot>,
    /// Context pointer the callee returned
    pub context: *mut u8,
}

/// Call the wasm function at `callee` through `thunk` with a fresh context
pub fn invoke(thunk: &JitUnit, callee: usize, args: &[Slot], num_results: usize) -> Invocation {
    let mut context = Box::new(ContextRuntimeData::new());
    invoke_in(thunk, callee, context.as_context_ptr(), args, num_results)
}

/// Call the wasm function at `callee` through `thunk` in `context`
pub fn invoke_in(
    thunk: &JitUnit,
    callee: usize,
    context: *mut u8,
    args: &[Slot],
    num_results: usize,
) -> Invocation {
    let entry = thunk
        .invoke_thunk_symbol()
        .expect("Unit has no invoke thunk")
        .base_address();
    let mut results = vec![Slot::default(); num_results.max(1)];
    let returned = unsafe {
        let entry: InvokeThunk = std::mem::transmute::<usize, InvokeThunk>(entry);
        entry(callee as *const u8, context, args.as_ptr(), results.as_mut_ptr())
    };
    results.truncate(num_results);
    Invocation {
        results,
        context: returned,
    }
}
