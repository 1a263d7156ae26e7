//! Import Resolution
//!
//! A unit resolves its undefined symbols only through the map supplied to
//! `load`. There is no fallback to the process's own symbols: a name missing
//! from the map is a load failure.

use std::collections::HashMap;

use tracing::{trace, warn};

use super::types::{JitError, JitResult};

/// Symbol name to host address, supplied per unit
pub type ImportedSymbolMap = HashMap<String, usize>;

/// Resolves a unit's undefined symbols against its import map
#[derive(Debug, Clone, Copy)]
pub struct ImportResolver<'a> {
    imports: &'a ImportedSymbolMap,
}

impl<'a> ImportResolver<'a> {
    pub fn new(imports: &'a ImportedSymbolMap) -> Self {
        ImportResolver { imports }
    }

    /// Address of `name`, or [`JitError::UnresolvedImport`]
    pub fn resolve(&self, name: &str) -> JitResult<usize> {
        match self.imports.get(name) {
            Some(&address) => {
                trace!(target: "wasmjit::jit::imports", name, address, "Resolved import");
                Ok(address)
            }
            None => {
                warn!(target: "wasmjit::jit::imports", name, "Import not present in symbol map");
                Err(JitError::UnresolvedImport(name.to_string()))
            }
        }
    }
}

/// One relocation resolved through the import map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    /// Imported symbol name
    pub name: String,
    /// Address the symbol resolved to
    pub address: usize,
    /// Address of the patched relocation field
    pub patch_address: usize,
}
