//! JIT error types.
//!
//! This module defines [`JitError`] and [`JitResult`] for lowering,
//! compilation and unit loading.

use std::fmt;

use crate::runtime::CallingConvention;

// =============================================================================
// JitResult and JitError
// =============================================================================

/// Error types for native code generation and loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// A non-wasm calling convention was asked to return more than one value
    UnsupportedResultCount {
        convention: CallingConvention,
        results: usize,
    },

    /// A base-address offset was not `field + k * pointer_size`
    InexactBaseOffset { field: &'static str, offset: u64 },

    /// The object references a symbol absent from the unit's import map
    UnresolvedImport(String),

    /// `load` was called on a unit that already holds code
    AlreadyLoaded,

    /// The object bytes could not be parsed
    ObjectParse(String),

    /// Relocation kind the loader does not implement
    UnsupportedRelocation(String),

    /// Relocated value does not fit the relocation field
    RelocationOutOfRange { symbol: String, value: i64 },

    /// Two published symbols cover the same address
    OverlappingSymbols { first: String, second: String },

    /// A defined function symbol the unit cannot attribute
    UnknownFunctionSymbol(String),

    /// Function table or unwind info entries are truncated or inconsistent
    MalformedUnwindTable(String),

    /// Executable memory could not be mapped or protected
    MemoryMap(String),

    /// Cranelift compilation error
    CompilationError(String),

    /// The IR module violates a structural assumption of emission
    InvalidModule(String),

    /// Value stack underflow while emitting a function body
    StackUnderflow,

    /// Backend configuration could not be parsed or applied
    Config(String),
}

impl JitError {
    /// Whether this error signals a compiler bug rather than bad input
    ///
    /// Fatal errors must halt instantiation of the module; they are never
    /// retried or recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JitError::UnsupportedResultCount { .. }
                | JitError::InexactBaseOffset { .. }
                | JitError::UnresolvedImport(_)
                | JitError::UnsupportedRelocation(_)
                | JitError::RelocationOutOfRange { .. }
                | JitError::OverlappingSymbols { .. }
                | JitError::UnknownFunctionSymbol(_)
                | JitError::MalformedUnwindTable(_)
        )
    }
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::UnsupportedResultCount { convention, results } => write!(
                f,
                "{} functions returning {} results aren't supported",
                convention, results
            ),
            JitError::InexactBaseOffset { field, offset } => {
                write!(f, "Offset {:#x} is not an exact {} entry", offset, field)
            }
            JitError::UnresolvedImport(name) => write!(f, "Unresolved import: {}", name),
            JitError::AlreadyLoaded => write!(f, "JIT unit already loaded"),
            JitError::ObjectParse(msg) => write!(f, "Object parse error: {}", msg),
            JitError::UnsupportedRelocation(msg) => write!(f, "Unsupported relocation: {}", msg),
            JitError::RelocationOutOfRange { symbol, value } => {
                write!(f, "Relocation to {} out of range: {:#x}", symbol, value)
            }
            JitError::OverlappingSymbols { first, second } => {
                write!(f, "Symbols {} and {} overlap", first, second)
            }
            JitError::UnknownFunctionSymbol(name) => {
                write!(f, "Unknown function symbol: {}", name)
            }
            JitError::MalformedUnwindTable(msg) => write!(f, "Malformed unwind table: {}", msg),
            JitError::MemoryMap(msg) => write!(f, "Memory map error: {}", msg),
            JitError::CompilationError(msg) => write!(f, "Compilation error: {}", msg),
            JitError::InvalidModule(msg) => write!(f, "Invalid module: {}", msg),
            JitError::StackUnderflow => write!(f, "Stack underflow"),
            JitError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for JitError {}

/// Result type for JIT operations
pub type JitResult<T> = Result<T, JitError>;
