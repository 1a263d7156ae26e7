//! WasmJIT - Native Code Generation Bridge for WebAssembly
//!
//! This library lowers validated WebAssembly modules to native machine code
//! with Cranelift and loads the result into executable memory for a host
//! engine.
//!
//! # Architecture
//!
//! 1. **IR** (`ir` module)
//!    - Value types, function types, imports and straight-line bodies
//!
//! 2. **Runtime surface** (`runtime` module)
//!    - Calling conventions and the compartment/context layouts generated
//!      code addresses
//!
//! 3. **Native code generation** (`jit` module)
//!    - Type and calling-convention lowering
//!    - Module and invoke thunk emission into relocatable objects
//!    - JIT units: private memory, relocation against a per-unit import map,
//!      exception table registration, symbol publication
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wasmjit::ir::{FunctionDef, FunctionType, IrModule, Operator, ValueType};
//! use wasmjit::jit::{BackendConfig, CodegenBackend, ImportedSymbolMap, JitUnit, UnitKind};
//! use wasmjit::runtime::FunctionInstance;
//!
//! let ty = FunctionType::new(vec![ValueType::I32], vec![ValueType::I32]);
//! let mut module = IrModule::new();
//! module.add_function(FunctionDef::new(ty.clone(), vec![Operator::LocalGet(0)]));
//!
//! let backend = CodegenBackend::new(BackendConfig::default()).unwrap();
//! let bytes = backend.compile(&module, "identity").unwrap();
//!
//! let instance = Arc::new(FunctionInstance::new(0, "identity", ty));
//! let unit = JitUnit::new(UnitKind::Module { functions: vec![instance] });
//! unit.load(&bytes, &ImportedSymbolMap::new(), false).unwrap();
//! assert!(unit.function_symbol(0).is_some());
//! ```

pub mod ir;
pub mod jit;
pub mod runtime;

pub use ir::{FunctionDef, FunctionImport, FunctionType, IrModule, Operator, TypeTuple, ValueType, V128};
pub use jit::{
    BackendConfig, CodegenBackend, ImportedSymbolMap, JitError, JitResult, JitSymbol, JitUnit,
    NativeModule, UnitKind,
};
pub use runtime::{CallingConvention, ContextRuntimeData, FunctionInstance};
