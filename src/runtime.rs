//! Compartment runtime surface
//!
//! The compartment runtime (instances, memories, tables) lives outside this
//! crate. Generated code only depends on the fixed layouts declared here:
//! the base-address arrays of [`CompartmentRuntimeData`] and the argument /
//! return area of [`ContextRuntimeData`].

use std::fmt;
use std::mem::{offset_of, size_of};

use crate::ir::FunctionType;

/// Maximum memories addressable by one compartment
pub const MAX_MEMORIES: usize = 255;

/// Maximum tables addressable by one compartment
pub const MAX_TABLES: usize = 256;

/// Size of the per-context argument/return area in bytes
pub const MAX_THUNK_ARG_AND_RETURN_BYTES: usize = 256;

/// Width of one argument/result slot in the return area and thunk buffers
pub const VALUE_SLOT_BYTES: usize = 16;

/// Calling conventions between wasm code, host intrinsics, and C code
///
/// The set is fixed; it is never extended at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// wasm-to-wasm calls
    Wasm,
    /// Host intrinsic taking the context pointer
    Intrinsic,
    /// Host intrinsic that may switch to a different context
    IntrinsicWithContextSwitch,
    /// Host intrinsic taking the context pointer plus memory and table ids
    IntrinsicWithMemAndTable,
    /// Plain C function, no implicit parameters
    C,
}

impl CallingConvention {
    pub const ALL: [CallingConvention; 5] = [
        CallingConvention::Wasm,
        CallingConvention::Intrinsic,
        CallingConvention::IntrinsicWithContextSwitch,
        CallingConvention::IntrinsicWithMemAndTable,
        CallingConvention::C,
    ];
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallingConvention::Wasm => "wasm",
            CallingConvention::Intrinsic => "intrinsic",
            CallingConvention::IntrinsicWithContextSwitch => "intrinsicWithContextSwitch",
            CallingConvention::IntrinsicWithMemAndTable => "intrinsicWithMemAndTable",
            CallingConvention::C => "c",
        };
        f.write_str(name)
    }
}

/// Per-compartment data addressed by generated code
///
/// Only the byte offsets of `memory_bases` and `table_bases` are part of
/// the code generation ABI; entries are pointer-sized.
#[repr(C)]
pub struct CompartmentRuntimeData {
    pub compartment: *mut u8,
    pub memory_bases: [*mut u8; MAX_MEMORIES],
    pub table_bases: [*mut u8; MAX_TABLES],
}

impl CompartmentRuntimeData {
    /// Byte offset of the memory base-address array
    pub const MEMORY_BASES_OFFSET: usize = offset_of!(CompartmentRuntimeData, memory_bases);

    /// Byte offset of the table base-address array
    pub const TABLE_BASES_OFFSET: usize = offset_of!(CompartmentRuntimeData, table_bases);

    /// Size of one base-address entry
    pub const POINTER_SIZE: usize = size_of::<*mut u8>();
}

/// Per-context data shared between generated code and the runtime
///
/// Results that do not fit in registers are written to
/// `thunk_arg_and_return_data`, one 16-byte slot per value.
#[repr(C, align(16))]
pub struct ContextRuntimeData {
    pub thunk_arg_and_return_data: [u8; MAX_THUNK_ARG_AND_RETURN_BYTES],
}

impl ContextRuntimeData {
    /// Byte offset of the argument/return area from the context pointer
    pub const RETURN_AREA_OFFSET: usize = offset_of!(ContextRuntimeData, thunk_arg_and_return_data);

    pub fn new() -> Self {
        ContextRuntimeData {
            thunk_arg_and_return_data: [0; MAX_THUNK_ARG_AND_RETURN_BYTES],
        }
    }

    /// Opaque context pointer passed to generated code
    pub fn as_context_ptr(&mut self) -> *mut u8 {
        self as *mut ContextRuntimeData as *mut u8
    }
}

impl Default for ContextRuntimeData {
    fn default() -> Self {
        Self::new()
    }
}

/// A function instance owned by the compartment runtime
///
/// Compiled symbols hold shared references to their instance; the instance
/// outlives or co-lives with every symbol that names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInstance {
    /// Index among the module's function definitions
    pub def_index: usize,
    pub debug_name: String,
    pub function_type: FunctionType,
}

impl FunctionInstance {
    pub fn new(def_index: usize, debug_name: impl Into<String>, function_type: FunctionType) -> Self {
        FunctionInstance {
            def_index,
            debug_name: debug_name.into(),
            function_type,
        }
    }
}
