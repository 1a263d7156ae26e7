//! Code offset to operation index maps
//!
//! Each compiled function carries a map from code offsets (relative to its
//! base address) to the index of the wasm operation that produced the code.
//! A trapping instruction pointer is translated with floor semantics: the
//! greatest recorded offset at or below the query.
//!
//! The maps travel inside the relocatable object in a dedicated section so
//! that the object bytes stay the only artifact between compile and load.
//! Layout (little-endian): `record_count: u32`, then per record
//! `name_len: u32, name, entry_count: u32, (offset: u32, op_index: u32)*`.

use std::collections::{BTreeMap, HashMap};

use super::types::{JitError, JitResult};

/// Name of the object section holding the encoded maps
pub const OP_MAP_SECTION_NAME: &str = ".wasm_opmap";

/// Sorted map from code offset to operation index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetToOpIndexMap(BTreeMap<u32, u32>);

impl OffsetToOpIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, offset: u32, op_index: u32) {
        self.0.insert(offset, op_index);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0.iter().map(|(offset, op)| (*offset, *op))
    }

    /// Operation index of the greatest offset `<= offset`
    ///
    /// Does not allocate; safe to call while diagnosing a trap.
    #[inline]
    pub fn lookup(&self, offset: u32) -> Option<u32> {
        self.0.range(..=offset).next_back().map(|(_, op)| *op)
    }
}

impl FromIterator<(u32, u32)> for OffsetToOpIndexMap {
    fn from_iter<I: IntoIterator<Item = (u32, u32)>>(iter: I) -> Self {
        OffsetToOpIndexMap(iter.into_iter().collect())
    }
}

/// Serialize per-symbol maps into section bytes
pub fn encode_op_maps(maps: &[(String, OffsetToOpIndexMap)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(maps.len() as u32).to_le_bytes());
    for (name, map) in maps {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(map.len() as u32).to_le_bytes());
        for (offset, op) in map.iter() {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&op.to_le_bytes());
        }
    }
    out
}

/// Decode section bytes produced by [`encode_op_maps`]
pub fn decode_op_maps(data: &[u8]) -> JitResult<HashMap<String, OffsetToOpIndexMap>> {
    let mut reader = SectionReader { data, pos: 0 };
    let count = reader.u32()?;
    // Each record needs at least 8 bytes
    let mut maps = HashMap::with_capacity((count as usize).min(data.len() / 8));
    for _ in 0..count {
        let name_len = reader.u32()? as usize;
        let name = std::str::from_utf8(reader.bytes(name_len)?)
            .map_err(|e| JitError::ObjectParse(format!("op map symbol name: {}", e)))?
            .to_string();
        let entries = reader.u32()?;
        let mut map = OffsetToOpIndexMap::new();
        for _ in 0..entries {
            let offset = reader.u32()?;
            let op = reader.u32()?;
            map.insert(offset, op);
        }
        maps.insert(name, map);
    }
    Ok(maps)
}

struct SectionReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    fn bytes(&mut self, len: usize) -> JitResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                JitError::ObjectParse(format!(
                    "{} section truncated at byte {}",
                    OP_MAP_SECTION_NAME, self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> JitResult<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
