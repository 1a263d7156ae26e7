//! Relocation Application
//!
//! Patches the loaded copy of each section so that references to other
//! sections and to imports point at their final addresses. Undefined symbols
//! are resolved through the unit's [`ImportResolver`] only; every such
//! resolution is recorded as an [`ImportBinding`].
//!
//! Supported relocation shapes:
//!
//! | shape            | value written       | width |
//! |------------------|---------------------|-------|
//! | absolute         | `S + A`             | 64/32 |
//! | pc-relative      | `S + A - P`         | 32    |
//! | aarch64 call     | `(S + A - P) >> 2`  | 26    |
//! | image-relative   | `S + A - image_base`| 32    |

use std::collections::HashMap;

use object::read::{File, Relocation, RelocationTarget, SymbolSection};
use object::{
    BinaryFormat, Object, ObjectSection, ObjectSymbol, RelocationEncoding,
    RelocationFlags, RelocationKind, SectionIndex,
};
use tracing::trace;

use super::imports::{ImportBinding, ImportResolver};
use super::memory::{Placement, UnitMemoryManager};
use super::types::{JitError, JitResult};

/// Where a section of the object was placed in unit memory
#[derive(Debug, Clone, Copy)]
pub struct LoadedSection {
    pub placement: Placement,
    /// Section address inside the object file (zero for most relocatables)
    pub object_address: u64,
}

/// Loaded sections by object section index
pub type SectionMap = HashMap<SectionIndex, LoadedSection>;

/// How a relocation field is patched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Abs64,
    Abs32,
    PcRel32,
    AArch64Call26,
    ImageRel32,
}

impl PatchKind {
    /// Bytes occupied by the patched field
    pub fn field_size(self) -> usize {
        match self {
            PatchKind::Abs64 => 8,
            PatchKind::Abs32
            | PatchKind::PcRel32
            | PatchKind::AArch64Call26
            | PatchKind::ImageRel32 => 4,
        }
    }

    /// Map an object relocation onto a supported patch shape
    pub fn classify(relocation: &Relocation) -> JitResult<PatchKind> {
        let kind = match (relocation.kind(), relocation.encoding(), relocation.size()) {
            (_, RelocationEncoding::AArch64Call, 26) => PatchKind::AArch64Call26,
            (RelocationKind::Absolute, RelocationEncoding::Generic, 64) => PatchKind::Abs64,
            (RelocationKind::Absolute, RelocationEncoding::Generic, 32) => PatchKind::Abs32,
            (
                RelocationKind::Relative | RelocationKind::PltRelative,
                RelocationEncoding::Generic
                | RelocationEncoding::X86Branch
                | RelocationEncoding::X86RipRelative,
                32,
            ) => PatchKind::PcRel32,
            (RelocationKind::ImageOffset, RelocationEncoding::Generic, 32) => PatchKind::ImageRel32,
            _ => match relocation.flags() {
                RelocationFlags::MachO {
                    r_type: object::macho::ARM64_RELOC_BRANCH26,
                    r_pcrel: true,
                    ..
                } => PatchKind::AArch64Call26,
                flags => {
                    return Err(JitError::UnsupportedRelocation(format!(
                        "{:?} ({:?}, {:?}, {} bits)",
                        flags,
                        relocation.kind(),
                        relocation.encoding(),
                        relocation.size()
                    )))
                }
            },
        };
        Ok(kind)
    }
}

/// Inputs to one field patch
#[derive(Debug, Clone, Copy)]
pub struct Patch<'a> {
    pub kind: PatchKind,
    /// `S`: address of the target
    pub target: u64,
    /// `A`: explicit addend
    pub addend: i64,
    /// Whether the field already holds part of the addend
    pub implicit_addend: bool,
    /// `P`: address of the field
    pub place: u64,
    pub image_base: u64,
    /// Target name, for diagnostics
    pub symbol: &'a str,
}

impl Patch<'_> {
    /// Write the relocated value into `field`
    pub fn apply(&self, field: &mut [u8]) -> JitResult<()> {
        let out_of_range = |value: i64| JitError::RelocationOutOfRange {
            symbol: self.symbol.to_string(),
            value,
        };

        match self.kind {
            PatchKind::Abs64 => {
                let implicit = if self.implicit_addend { read_u64(field) as i64 } else { 0 };
                let value = self.target.wrapping_add(self.addend.wrapping_add(implicit) as u64);
                field[..8].copy_from_slice(&value.to_le_bytes());
            }
            PatchKind::Abs32 => {
                let value = self.target as i64 + self.addend + self.implicit_i32(field);
                let value = u32::try_from(value).map_err(|_| out_of_range(value))?;
                field[..4].copy_from_slice(&value.to_le_bytes());
            }
            PatchKind::PcRel32 => {
                let value = self.target.wrapping_sub(self.place) as i64
                    + self.addend
                    + self.implicit_i32(field);
                let value = i32::try_from(value).map_err(|_| out_of_range(value))?;
                field[..4].copy_from_slice(&value.to_le_bytes());
            }
            PatchKind::ImageRel32 => {
                let value = self.target.wrapping_sub(self.image_base) as i64
                    + self.addend
                    + self.implicit_i32(field);
                let value = u32::try_from(value).map_err(|_| out_of_range(value))?;
                field[..4].copy_from_slice(&value.to_le_bytes());
            }
            PatchKind::AArch64Call26 => {
                const IMM26: u32 = 0x03ff_ffff;
                let insn = read_u32(field);
                let implicit = if self.implicit_addend {
                    // Sign-extend imm26 and scale to bytes
                    (((insn & IMM26) << 6) as i32 >> 4) as i64
                } else {
                    0
                };
                let value = self.target.wrapping_sub(self.place) as i64 + self.addend + implicit;
                if value % 4 != 0 || !(-(1i64 << 27)..(1i64 << 27)).contains(&value) {
                    return Err(out_of_range(value));
                }
                let insn = (insn & !IMM26) | ((value >> 2) as u32 & IMM26);
                field[..4].copy_from_slice(&insn.to_le_bytes());
            }
        }
        Ok(())
    }

    fn implicit_i32(&self, field: &[u8]) -> i64 {
        if self.implicit_addend {
            read_u32(field) as i32 as i64
        } else {
            0
        }
    }
}

fn read_u32(field: &[u8]) -> u32 {
    u32::from_le_bytes([field[0], field[1], field[2], field[3]])
}

fn read_u64(field: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&field[..8]);
    u64::from_le_bytes(bytes)
}

/// Symbol name with platform mangling removed
pub fn symbol_name<'data>(file: &File<'data>, raw: &'data str) -> &'data str {
    if file.format() == BinaryFormat::MachO {
        raw.strip_prefix('_').unwrap_or(raw)
    } else {
        raw
    }
}

/// Loaded address of a defined symbol
pub fn defined_symbol_address(
    symbol_address: u64,
    section: SectionIndex,
    sections: &SectionMap,
    memory: &UnitMemoryManager,
) -> Option<usize> {
    let loaded = sections.get(&section)?;
    let offset = symbol_address.checked_sub(loaded.object_address)?;
    Some(memory.address_of(&loaded.placement) + offset as usize)
}

/// Apply every relocation of every loaded section
pub fn apply_relocations(
    file: &File<'_>,
    sections: &SectionMap,
    memory: &mut UnitMemoryManager,
    resolver: &ImportResolver<'_>,
    image_base: usize,
) -> JitResult<Vec<ImportBinding>> {
    let mut bindings = Vec::new();
    let mut resolved: HashMap<String, usize> = HashMap::new();

    for section in file.sections() {
        let Some(loaded) = sections.get(&section.index()) else {
            continue;
        };

        for (offset, relocation) in section.relocations() {
            let kind = PatchKind::classify(&relocation)?;
            let (target, name, is_import) =
                relocation_target(file, &relocation, sections, memory, resolver, &mut resolved)?;

            // Relocation offsets are relative to the start of their section
            let field_offset = usize::try_from(offset)
                .ok()
                .filter(|o| o.saturating_add(kind.field_size()) <= loaded.placement.size)
                .ok_or_else(|| {
                    JitError::ObjectParse(format!("relocation offset {:#x} out of range", offset))
                })?;
            let place = memory.address_of(&loaded.placement) + field_offset;

            let patch = Patch {
                kind,
                target: target as u64,
                addend: relocation.addend(),
                implicit_addend: relocation.has_implicit_addend(),
                place: place as u64,
                image_base: image_base as u64,
                symbol: &name,
            };
            let field = memory.bytes_mut(
                loaded.placement.region,
                loaded.placement.offset + field_offset,
                kind.field_size(),
            )?;
            patch.apply(field)?;

            trace!(
                target: "wasmjit::jit::relocate",
                symbol = %name,
                ?kind,
                place = format_args!("{:#x}", place),
                target = format_args!("{:#x}", target),
                "Applied relocation"
            );

            if is_import {
                bindings.push(ImportBinding {
                    name,
                    address: target,
                    patch_address: place,
                });
            }
        }
    }

    Ok(bindings)
}

/// Address, display name and import-ness of a relocation's target
fn relocation_target(
    file: &File<'_>,
    relocation: &Relocation,
    sections: &SectionMap,
    memory: &UnitMemoryManager,
    resolver: &ImportResolver<'_>,
    resolved: &mut HashMap<String, usize>,
) -> JitResult<(usize, String, bool)> {
    match relocation.target() {
        RelocationTarget::Symbol(index) => {
            let symbol = file
                .symbol_by_index(index)
                .map_err(|e| JitError::ObjectParse(e.to_string()))?;
            let raw = symbol
                .name()
                .map_err(|e| JitError::ObjectParse(e.to_string()))?;
            let name = symbol_name(file, raw);

            match symbol.section() {
                SymbolSection::Undefined => {
                    if let Some(&address) = resolved.get(name) {
                        return Ok((address, name.to_string(), true));
                    }
                    let address = resolver.resolve(name)?;
                    resolved.insert(name.to_string(), address);
                    Ok((address, name.to_string(), true))
                }
                SymbolSection::Section(section) => {
                    let address =
                        defined_symbol_address(symbol.address(), section, sections, memory)
                            .ok_or_else(|| {
                                JitError::UnsupportedRelocation(format!(
                                    "target {} lives in a section that is not loaded",
                                    name
                                ))
                            })?;
                    Ok((address, name.to_string(), false))
                }
                SymbolSection::Absolute => Ok((symbol.address() as usize, name.to_string(), false)),
                other => Err(JitError::UnsupportedRelocation(format!(
                    "target {} has unsupported placement {:?}",
                    name, other
                ))),
            }
        }
        RelocationTarget::Section(section) => {
            let object_address = file
                .section_by_index(section)
                .map(|s| s.address())
                .map_err(|e| JitError::ObjectParse(e.to_string()))?;
            let address = defined_symbol_address(object_address, section, sections, memory)
                .ok_or_else(|| {
                    JitError::UnsupportedRelocation(format!(
                        "target section {} is not loaded",
                        section.0
                    ))
                })?;
            Ok((address, format!("section#{}", section.0), false))
        }
        other => Err(JitError::UnsupportedRelocation(format!("{:?} target", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(kind: PatchKind, target: u64, addend: i64, place: u64) -> Patch<'static> {
        Patch {
            kind,
            target,
            addend,
            implicit_addend: false,
            place,
            image_base: 0,
            symbol: "functionImport0",
        }
    }

    #[test]
    fn test_abs64() {
        let mut field = [0u8; 8];
        patch(PatchKind::Abs64, 0x7fff_0000_1000, 8, 0)
            .apply(&mut field)
            .unwrap();
        assert_eq!(u64::from_le_bytes(field), 0x7fff_0000_1008);
    }

    #[test]
    fn test_abs64_implicit_addend() {
        let mut field = 0x10u64.to_le_bytes();
        let mut p = patch(PatchKind::Abs64, 0x1000, 0, 0);
        p.implicit_addend = true;
        p.apply(&mut field).unwrap();
        assert_eq!(u64::from_le_bytes(field), 0x1010);
    }

    #[test]
    fn test_pc_relative() {
        let mut field = [0u8; 4];
        patch(PatchKind::PcRel32, 0x1000, -4, 0x2000)
            .apply(&mut field)
            .unwrap();
        assert_eq!(i32::from_le_bytes(field), 0x1000 - 0x2000 - 4);
    }

    #[test]
    fn test_pc_relative_out_of_range() {
        let mut field = [0u8; 4];
        let err = patch(PatchKind::PcRel32, 0x1_0000_0000_0000, 0, 0x1000)
            .apply(&mut field)
            .unwrap_err();
        assert!(matches!(err, JitError::RelocationOutOfRange { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_aarch64_call() {
        // bl #0
        let mut field = 0x9400_0000u32.to_le_bytes();
        patch(PatchKind::AArch64Call26, 0x1000, 0, 0x2000)
            .apply(&mut field)
            .unwrap();
        let insn = u32::from_le_bytes(field);
        assert_eq!(insn & 0xfc00_0000, 0x9400_0000);
        let imm = ((insn & 0x03ff_ffff) << 6) as i32 >> 6;
        assert_eq!(imm, -0x1000 / 4);
    }

    #[test]
    fn test_aarch64_call_out_of_range() {
        let mut field = 0x9400_0000u32.to_le_bytes();
        assert!(patch(PatchKind::AArch64Call26, 1 << 30, 0, 0)
            .apply(&mut field)
            .is_err());
    }

    #[test]
    fn test_image_relative() {
        let mut field = [0u8; 4];
        let mut p = patch(PatchKind::ImageRel32, 0x5010, 0, 0);
        p.image_base = 0x5000;
        p.apply(&mut field).unwrap();
        assert_eq!(u32::from_le_bytes(field), 0x10);
    }
}
