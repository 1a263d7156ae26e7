//! Symbol Registry
//!
//! Every function a unit loads is described by a [`JitSymbol`]. The symbols of
//! one unit live in a [`SymbolTable`] arena sorted by base address and are
//! addressed by [`SymbolHandle`]. Once built, the table is immutable: address
//! lookups are a binary search with no locks and no allocation, which is what
//! trap diagnosis needs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::op_map::OffsetToOpIndexMap;
use super::types::{JitError, JitResult};
use crate::ir::FunctionType;
use crate::runtime::FunctionInstance;

/// What a loaded symbol is
#[derive(Debug, Clone)]
pub enum SymbolKind {
    /// Compiled body of a wasm function definition
    FunctionInstance(Arc<FunctionInstance>),
    /// Host-to-wasm entry thunk for a function type
    InvokeThunk(FunctionType),
}

impl SymbolKind {
    pub fn function_instance(&self) -> Option<&Arc<FunctionInstance>> {
        match self {
            SymbolKind::FunctionInstance(instance) => Some(instance),
            SymbolKind::InvokeThunk(_) => None,
        }
    }

    pub fn invoke_thunk_type(&self) -> Option<&FunctionType> {
        match self {
            SymbolKind::InvokeThunk(ty) => Some(ty),
            SymbolKind::FunctionInstance(_) => None,
        }
    }
}

/// A function loaded into executable memory
#[derive(Debug, Clone)]
pub struct JitSymbol {
    name: String,
    kind: SymbolKind,
    base_address: usize,
    num_bytes: usize,
    offset_to_op_index: OffsetToOpIndexMap,
}

impl JitSymbol {
    pub fn new(
        name: impl Into<String>,
        kind: SymbolKind,
        base_address: usize,
        num_bytes: usize,
        offset_to_op_index: OffsetToOpIndexMap,
    ) -> Self {
        JitSymbol {
            name: name.into(),
            kind,
            base_address,
            num_bytes,
            offset_to_op_index,
        }
    }

    /// Object symbol name (without platform mangling)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SymbolKind {
        &self.kind
    }

    pub fn base_address(&self) -> usize {
        self.base_address
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// One past the last byte of code
    pub fn end_address(&self) -> usize {
        self.base_address + self.num_bytes
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    pub fn offset_to_op_index(&self) -> &OffsetToOpIndexMap {
        &self.offset_to_op_index
    }

    /// Operation index of the code at `address`, if it belongs to this symbol
    pub fn op_index_at(&self, address: usize) -> Option<u32> {
        if !self.contains(address) {
            return None;
        }
        let offset = u32::try_from(address - self.base_address).ok()?;
        self.offset_to_op_index.lookup(offset)
    }
}

impl fmt::Display for JitSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {:#x}..{:#x}",
            self.name,
            self.base_address,
            self.end_address()
        )
    }
}

/// Index of a symbol in its unit's [`SymbolTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolHandle(u32);

impl SymbolHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Immutable arena of a unit's symbols, sorted by base address
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<JitSymbol>,
    by_name: HashMap<String, SymbolHandle>,
}

impl SymbolTable {
    /// Sort `symbols` by address and check their ranges are pairwise disjoint
    pub fn build(mut symbols: Vec<JitSymbol>) -> JitResult<Self> {
        symbols.sort_by_key(|s| (s.base_address, s.num_bytes));

        for pair in symbols.windows(2) {
            if pair[0].end_address() > pair[1].base_address {
                return Err(JitError::OverlappingSymbols {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }

        let by_name = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), SymbolHandle(i as u32)))
            .collect();

        Ok(SymbolTable { symbols, by_name })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn get(&self, handle: SymbolHandle) -> Option<&JitSymbol> {
        self.symbols.get(handle.index())
    }

    /// Symbols in ascending address order
    pub fn iter(&self) -> impl Iterator<Item = (SymbolHandle, &JitSymbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolHandle(i as u32), s))
    }

    /// Symbol whose code range contains `address`
    #[inline]
    pub fn find_by_address(&self, address: usize) -> Option<SymbolHandle> {
        let upper = self.symbols.partition_point(|s| s.base_address <= address);
        let index = upper.checked_sub(1)?;
        if self.symbols[index].contains(address) {
            Some(SymbolHandle(index as u32))
        } else {
            None
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<SymbolHandle> {
        self.by_name.get(name).copied()
    }
}
