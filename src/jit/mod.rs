//! Cranelift Native Code Generation Bridge
//!
//! Turns validated WebAssembly modules into native code and loads it into
//! executable memory, one JIT unit per module or invoke thunk:
//!
//! ```text
//! IrModule ─emit_module─▶ NativeModule ─compile_module─▶ object bytes
//!                                                           │
//!            ImportedSymbolMap ──────────────────▶ JitUnit::load
//!                                                           │
//!                       symbols / op indices / exception tables ◀┘
//! ```
//!
//! # Modules
//!
//! - [`types`]: NativeType, NativeFunctionType, JitError, JitResult
//! - [`lowering`]: value type and result-tuple lowering
//! - [`calling_conv`]: native signatures for each calling convention
//! - [`literals`]: constants and compartment base-offset arithmetic
//! - [`codegen`]: Cranelift IR generation helpers
//! - [`emit`]: module and invoke thunk emission
//! - [`backend`]: the shared backend handle
//! - [`config`]: backend configuration
//! - [`naming`]: external symbol names
//! - [`unit`]: JIT units, loading and symbol publication
//! - [`memory`], [`relocate`], [`imports`]: the unit loader's pieces
//! - [`unwind`]: Windows x64 exception tables
//! - [`symbol`], [`op_map`]: published symbols and offset-to-op maps

pub mod backend;
pub mod calling_conv;
pub mod codegen;
pub mod config;
pub mod emit;
pub mod imports;
pub mod literals;
pub mod lowering;
pub mod memory;
pub mod naming;
pub mod op_map;
pub mod relocate;
pub mod symbol;
pub mod types;
pub mod unit;
pub mod unwind;

// Re-export main types
pub use backend::CodegenBackend;
pub use calling_conv::{build_signature, native_signature};
pub use codegen::CodegenContext;
pub use config::{BackendConfig, OptLevel};
pub use emit::NativeModule;
pub use imports::{ImportBinding, ImportedSymbolMap};
pub use literals::{
    emit_literal, memory_index_from_base_offset, table_index_from_base_offset, Constant, Literal,
};
pub use lowering::{lower_tuple, lower_type, results_returned_directly, MAX_DIRECTLY_RETURNED_VALUES};
pub use naming::{external_name_of, function_index_from_external_name, invoke_thunk_name};
pub use op_map::OffsetToOpIndexMap;
pub use symbol::{JitSymbol, SymbolHandle, SymbolKind};
pub use types::{JitError, JitResult, NativeFunctionType, NativeType, PointeeKind};
pub use unit::{JitUnit, UnitKind};
pub use unwind::{ExceptionTableStrategy, RebasedFunctionTable};
