//! Unit Memory Manager
//!
//! Each [`JitUnit`](super::unit::JitUnit) owns exactly one manager. Sections
//! are assigned to one of two regions:
//!
//! - **code**: text and read-only data. Writable while relocations are
//!   applied, then sealed read+execute.
//! - **data**: writable data and zero-initialized data. Stays read+write.
//!
//! Both regions are anonymous mappings released when the manager is dropped.

use std::ffi::c_void;
use std::ops::Range;

use memmap2::{Mmap, MmapMut};
use tracing::debug;
use wasmtime_internal_jit_icache_coherence as icache;

use super::types::{JitError, JitResult};

/// Mapping granularity; regions are rounded up to whole pages
const PAGE_SIZE: usize = 4096;

/// Which region a section is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Code,
    Data,
}

/// Offsets of placed sections within their region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub region: RegionKind,
    pub offset: usize,
    pub size: usize,
}

/// Accumulates section sizes and alignments before anything is mapped
#[derive(Debug, Default)]
pub struct MemoryLayout {
    code_size: usize,
    data_size: usize,
}

impl MemoryLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size` bytes aligned to `align` in `region`
    pub fn reserve(&mut self, region: RegionKind, size: usize, align: usize) -> Placement {
        let cursor = match region {
            RegionKind::Code => &mut self.code_size,
            RegionKind::Data => &mut self.data_size,
        };
        let offset = align_up(*cursor, align.max(1));
        *cursor = offset + size;
        Placement {
            region,
            offset,
            size,
        }
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }
}

enum CodeRegion {
    Writable(MmapMut),
    Executable(Mmap),
    /// Transient state while changing protection
    Sealing,
}

/// Owns a unit's code and data mappings
pub struct UnitMemoryManager {
    code: CodeRegion,
    data: MmapMut,
    code_size: usize,
}

impl UnitMemoryManager {
    /// Map zeroed regions large enough for `layout`
    pub fn allocate(layout: &MemoryLayout) -> JitResult<Self> {
        let code = map_region(layout.code_size(), "code")?;
        let data = map_region(layout.data_size(), "data")?;
        debug!(
            target: "wasmjit::jit::memory",
            code_bytes = code.len(),
            data_bytes = data.len(),
            "Mapped unit memory"
        );
        Ok(UnitMemoryManager {
            code: CodeRegion::Writable(code),
            data,
            code_size: layout.code_size(),
        })
    }

    /// Base address of a region
    pub fn base_address(&self, region: RegionKind) -> usize {
        match region {
            RegionKind::Code => match &self.code {
                CodeRegion::Writable(map) => map.as_ptr() as usize,
                CodeRegion::Executable(map) => map.as_ptr() as usize,
                CodeRegion::Sealing => 0,
            },
            RegionKind::Data => self.data.as_ptr() as usize,
        }
    }

    /// Absolute address of a placed section
    pub fn address_of(&self, placement: &Placement) -> usize {
        self.base_address(placement.region) + placement.offset
    }

    /// Writable view of `len` bytes at `offset` within `region`
    pub fn bytes_mut(
        &mut self,
        region: RegionKind,
        offset: usize,
        len: usize,
    ) -> JitResult<&mut [u8]> {
        let map = match region {
            RegionKind::Code => match &mut self.code {
                CodeRegion::Writable(map) => map,
                _ => {
                    return Err(JitError::MemoryMap(
                        "code region is sealed and no longer writable".to_string(),
                    ))
                }
            },
            RegionKind::Data => &mut self.data,
        };
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= map.len())
            .ok_or_else(|| {
                JitError::MemoryMap(format!(
                    "write of {} bytes at offset {:#x} is outside the {:?} region",
                    len, offset, region
                ))
            })?;
        Ok(&mut map[offset..end])
    }

    /// Copy `bytes` to the start of a placed section
    pub fn write_section(&mut self, placement: &Placement, bytes: &[u8]) -> JitResult<()> {
        if bytes.len() > placement.size {
            return Err(JitError::MemoryMap(format!(
                "section contents ({} bytes) exceed placement ({} bytes)",
                bytes.len(),
                placement.size
            )));
        }
        self.bytes_mut(placement.region, placement.offset, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Flush the instruction cache and make the code region read+execute
    ///
    /// Nothing in the code region may be written afterwards.
    pub fn seal_code(&mut self) -> JitResult<()> {
        let writable = match std::mem::replace(&mut self.code, CodeRegion::Sealing) {
            CodeRegion::Writable(map) => map,
            other => {
                self.code = other;
                return Err(JitError::MemoryMap("code region already sealed".to_string()));
            }
        };

        // SAFETY: the range is exactly the live mapping being sealed.
        unsafe { icache::clear_cache(writable.as_ptr() as *const c_void, writable.len()) }
            .map_err(|e| JitError::MemoryMap(format!("instruction cache flush failed: {}", e)))?;

        let executable = writable
            .make_exec()
            .map_err(|e| JitError::MemoryMap(format!("failed to seal code region: {}", e)))?;
        icache::pipeline_flush_mt()
            .map_err(|e| JitError::MemoryMap(format!("pipeline flush failed: {}", e)))?;

        self.code = CodeRegion::Executable(executable);
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.code, CodeRegion::Executable(_))
    }

    /// Address range occupied by code and read-only data
    pub fn code_range(&self) -> Range<usize> {
        let base = self.base_address(RegionKind::Code);
        base..base + self.code_size
    }
}

impl std::fmt::Debug for UnitMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitMemoryManager")
            .field("code", &self.code_range())
            .field("data_base", &self.base_address(RegionKind::Data))
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

fn map_region(size: usize, what: &str) -> JitResult<MmapMut> {
    let len = align_up(size.max(1), PAGE_SIZE);
    MmapMut::map_anon(len)
        .map_err(|e| JitError::MemoryMap(format!("failed to map {} bytes of {}: {}", len, what, e)))
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}
