//! Exception Table Processing
//!
//! Windows x64 finds unwind information through `RUNTIME_FUNCTION` tables
//! whose addresses are RVAs relative to an image base. A unit's `.pdata` and
//! `.xdata` sections are emitted section-relative (function offsets relative
//! to `.text`, unwind info offsets relative to `.xdata`); after the unit is
//! laid out they are rebased onto the unit's image base and registered with
//! the OS.
//!
//! Every emitted `UNWIND_INFO` names a language-specific handler. Handlers are
//! redirected to a trampoline inside the unit that jumps to the engine's
//! `wasmjitSehHandler` import, since the handler RVA must stay within 4GB of
//! the image base.
//!
//! Other hosts use [`ExceptionTableStrategy::Unsupported`] and skip all of it.

use std::collections::HashSet;

use tracing::debug;

use super::types::{JitError, JitResult};

pub const PDATA_SECTION_NAME: &str = ".pdata";
pub const XDATA_SECTION_NAME: &str = ".xdata";

/// Import map entry the handler trampoline jumps to
pub const SEH_HANDLER_SYMBOL: &str = "wasmjitSehHandler";

/// Size of one `RUNTIME_FUNCTION` entry
pub const RUNTIME_FUNCTION_SIZE: usize = 12;

/// Size reserved for the handler trampoline
pub const TRAMPOLINE_SIZE: usize = 16;

pub const UNW_FLAG_EHANDLER: u8 = 0x1;
pub const UNW_FLAG_UHANDLER: u8 = 0x2;
pub const UNW_FLAG_CHAININFO: u8 = 0x4;

/// How a unit's exception tables are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionTableStrategy {
    /// Rebase and register Win64 `RUNTIME_FUNCTION` tables
    WindowsSeh,
    /// Rebase Win64 tables and install the handler trampoline, leaving
    /// registration to the embedder
    WindowsSehRebaseOnly,
    /// No platform exception tables
    Unsupported,
}

impl ExceptionTableStrategy {
    pub fn host() -> Self {
        if cfg!(all(windows, target_arch = "x86_64")) {
            ExceptionTableStrategy::WindowsSeh
        } else {
            ExceptionTableStrategy::Unsupported
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(
            self,
            ExceptionTableStrategy::WindowsSeh | ExceptionTableStrategy::WindowsSehRebaseOnly
        )
    }

    /// Whether rebased tables are handed to the OS
    pub fn registers_with_os(self) -> bool {
        self == ExceptionTableStrategy::WindowsSeh
    }
}

/// Where a unit's rebased `.pdata` entries live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebasedFunctionTable {
    pub address: usize,
    pub num_functions: usize,
    pub image_base: usize,
}

/// One entry of a `.pdata` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind_info: u32,
}

impl RuntimeFunction {
    pub fn read(bytes: &[u8]) -> Self {
        RuntimeFunction {
            begin: read_u32(bytes, 0),
            end: read_u32(bytes, 4),
            unwind_info: read_u32(bytes, 8),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.begin.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.end.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.unwind_info.to_le_bytes());
    }
}

/// Builds section-relative `.pdata`/`.xdata` contents at emission time
#[derive(Debug, Default)]
pub struct UnwindTableBuilder {
    pdata: Vec<u8>,
    xdata: Vec<u8>,
}

impl UnwindTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pdata.is_empty()
    }

    /// Add a function at `code_offset` within `.text` with its `UNWIND_INFO`
    ///
    /// Every function gets an exception and termination handler whose RVA
    /// slot follows the unwind codes; the loader points it at the unit's
    /// handler trampoline.
    pub fn add_function(&mut self, code_offset: u32, code_len: u32, unwind_info: &[u8]) {
        // UNWIND_INFO must be DWORD aligned
        while self.xdata.len() % 4 != 0 {
            self.xdata.push(0);
        }
        let entry = RuntimeFunction {
            begin: code_offset,
            end: code_offset + code_len,
            unwind_info: self.xdata.len() as u32,
        };
        self.xdata.extend_from_slice(&with_handler(unwind_info));

        let at = self.pdata.len();
        self.pdata.resize(at + RUNTIME_FUNCTION_SIZE, 0);
        entry.write(&mut self.pdata[at..]);
    }

    /// `(pdata, xdata)` section contents
    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.pdata, self.xdata)
    }
}

/// `unwind_info` with both handler flags set and a zeroed handler RVA
///
/// Infos that already name a handler or chain to another entry are returned
/// unchanged, as are infos too short to hold a header.
fn with_handler(unwind_info: &[u8]) -> Vec<u8> {
    let mut info = unwind_info.to_vec();
    if info.len() < 4 {
        return info;
    }
    let flags = info[0] >> 3;
    if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER | UNW_FLAG_CHAININFO) != 0 {
        return info;
    }
    info[0] |= (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) << 3;
    let handler_at = handler_offset(info[2] as usize);
    info.resize(handler_at + 4, 0);
    info
}

/// Offset of the handler RVA within an `UNWIND_INFO` of `count_of_codes` codes
fn handler_offset(count_of_codes: usize) -> usize {
    // Unwind codes are padded to an even count
    4 + 2 * ((count_of_codes + 1) & !1)
}

/// Result of rebasing a unit's tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindFixup {
    pub num_functions: usize,
    pub handlers_redirected: usize,
}

/// Rebase copied `.pdata`/`.xdata` contents onto `image_base`
///
/// `pdata_copy` entries hold function offsets relative to the code section
/// loaded at `code_section_address` and unwind info offsets relative to the
/// `.xdata` section loaded at `xdata_section_address`. Afterwards every
/// address is an RVA from `image_base`, and every handler names
/// `trampoline_address`.
pub fn fix_up_unwind_tables(
    image_base: usize,
    code_section_address: usize,
    pdata_copy: &mut [u8],
    xdata_section_address: usize,
    xdata_copy: &mut [u8],
    trampoline_address: usize,
) -> JitResult<UnwindFixup> {
    if pdata_copy.len() % RUNTIME_FUNCTION_SIZE != 0 {
        return Err(JitError::MalformedUnwindTable(format!(
            "{} bytes of .pdata is not a whole number of entries",
            pdata_copy.len()
        )));
    }

    let code_rva = rva(image_base, code_section_address, "code section")?;
    let xdata_rva = rva(image_base, xdata_section_address, ".xdata section")?;

    let mut fixup = UnwindFixup::default();
    let mut visited = HashSet::new();

    for entry_bytes in pdata_copy.chunks_exact_mut(RUNTIME_FUNCTION_SIZE) {
        let entry = RuntimeFunction::read(entry_bytes);
        let unwind_offset = entry.unwind_info as usize;

        let rebased = rebase_entry(entry, code_rva, xdata_rva)?;
        rebased.write(entry_bytes);
        fixup.num_functions += 1;

        if visited.insert(unwind_offset) {
            fix_up_unwind_info(
                image_base,
                code_rva,
                xdata_rva,
                xdata_copy,
                unwind_offset,
                trampoline_address,
                &mut fixup,
            )?;
        }
    }

    debug!(
        target: "wasmjit::jit::unwind",
        functions = fixup.num_functions,
        handlers = fixup.handlers_redirected,
        "Rebased exception tables"
    );
    Ok(fixup)
}

fn rebase_entry(entry: RuntimeFunction, code_rva: u32, xdata_rva: u32) -> JitResult<RuntimeFunction> {
    let overflow = || JitError::MalformedUnwindTable("RVA exceeds 32 bits".to_string());
    if entry.end < entry.begin {
        return Err(JitError::MalformedUnwindTable(format!(
            "function range {:#x}..{:#x} is inverted",
            entry.begin, entry.end
        )));
    }
    Ok(RuntimeFunction {
        begin: entry.begin.checked_add(code_rva).ok_or_else(overflow)?,
        end: entry.end.checked_add(code_rva).ok_or_else(overflow)?,
        unwind_info: entry.unwind_info.checked_add(xdata_rva).ok_or_else(overflow)?,
    })
}

fn fix_up_unwind_info(
    image_base: usize,
    code_rva: u32,
    xdata_rva: u32,
    xdata: &mut [u8],
    offset: usize,
    trampoline_address: usize,
    fixup: &mut UnwindFixup,
) -> JitResult<()> {
    let header = xdata.get(offset..offset + 4).ok_or_else(|| {
        JitError::MalformedUnwindTable(format!("UNWIND_INFO at {:#x} is out of bounds", offset))
    })?;
    let version = header[0] & 0x7;
    let flags = header[0] >> 3;
    let count_of_codes = header[2] as usize;
    if version != 1 && version != 2 {
        return Err(JitError::MalformedUnwindTable(format!(
            "UNWIND_INFO at {:#x} has unknown version {}",
            offset, version
        )));
    }

    let trailer = offset + handler_offset(count_of_codes);

    if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
        let trampoline_rva = rva(image_base, trampoline_address, "handler trampoline")?;
        let field = xdata.get_mut(trailer..trailer + 4).ok_or_else(|| {
            JitError::MalformedUnwindTable(format!(
                "handler of UNWIND_INFO at {:#x} is out of bounds",
                offset
            ))
        })?;
        field.copy_from_slice(&trampoline_rva.to_le_bytes());
        fixup.handlers_redirected += 1;
    } else if flags & UNW_FLAG_CHAININFO != 0 {
        let chained = xdata
            .get_mut(trailer..trailer + RUNTIME_FUNCTION_SIZE)
            .ok_or_else(|| {
                JitError::MalformedUnwindTable(format!(
                    "chained entry of UNWIND_INFO at {:#x} is out of bounds",
                    offset
                ))
            })?;
        let rebased = rebase_entry(RuntimeFunction::read(chained), code_rva, xdata_rva)?;
        rebased.write(chained);
    }
    Ok(())
}

fn rva(image_base: usize, address: usize, what: &str) -> JitResult<u32> {
    address
        .checked_sub(image_base)
        .and_then(|offset| u32::try_from(offset).ok())
        .ok_or_else(|| {
            JitError::MalformedUnwindTable(format!(
                "{} at {:#x} is not within 4GB above image base {:#x}",
                what, address, image_base
            ))
        })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// x86-64 `jmp [rip+0]` followed by the absolute target
pub fn trampoline_stub(target: u64) -> [u8; TRAMPOLINE_SIZE] {
    let mut stub = [0xcc; TRAMPOLINE_SIZE];
    stub[0..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    stub[6..14].copy_from_slice(&target.to_le_bytes());
    stub
}

// =============================================================================
// OS registration
// =============================================================================

/// A function table registered with the OS, removed on drop
#[derive(Debug)]
pub struct FunctionTableRegistration {
    #[cfg_attr(not(windows), allow(dead_code))]
    table: *const u8,
}

// SAFETY: the pointer is only handed back to the OS on drop.
unsafe impl Send for FunctionTableRegistration {}
unsafe impl Sync for FunctionTableRegistration {}

#[cfg(windows)]
mod sys {
    extern "system" {
        pub fn RtlAddFunctionTable(function_table: *const u8, entry_count: u32, base_address: u64) -> u8;
        pub fn RtlDeleteFunctionTable(function_table: *const u8) -> u8;
    }
}

impl FunctionTableRegistration {
    /// Register `num_functions` rebased entries at `table`
    ///
    /// # Safety
    /// `table` must point at the rebased entries and outlive the registration.
    #[cfg(windows)]
    pub unsafe fn register(
        table: *const u8,
        num_functions: usize,
        image_base: usize,
    ) -> JitResult<Self> {
        let count = u32::try_from(num_functions)
            .map_err(|_| JitError::MalformedUnwindTable("too many functions".to_string()))?;
        if sys::RtlAddFunctionTable(table, count, image_base as u64) == 0 {
            return Err(JitError::MalformedUnwindTable(
                "RtlAddFunctionTable rejected the table".to_string(),
            ));
        }
        Ok(FunctionTableRegistration { table })
    }

    /// # Safety
    /// See the Windows variant.
    #[cfg(not(windows))]
    pub unsafe fn register(
        _table: *const u8,
        _num_functions: usize,
        _image_base: usize,
    ) -> JitResult<Self> {
        Err(JitError::MalformedUnwindTable(
            "function tables are only registered on Windows".to_string(),
        ))
    }
}

impl Drop for FunctionTableRegistration {
    fn drop(&mut self) {
        #[cfg(windows)]
        unsafe {
            sys::RtlDeleteFunctionTable(self.table);
        }
    }
}
