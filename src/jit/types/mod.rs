//! JIT Type Definitions
//!
//! This module defines the core types shared by lowering, emission and loading:
//! - [`NativeType`] and [`NativeFunctionType`]: backend-level types
//! - [`JitResult`] and [`JitError`]: Result types for JIT operations

mod error;
mod native;


// Re-export error types
pub use error::{JitError, JitResult};

// Re-export native types
pub use native::{NativeFunctionType, NativeType, NativeTypeVector, PointeeKind};
