//! JIT Unit
//!
//! A [`JitUnit`] owns the executable image of one compiled module or one
//! invoke thunk. [`JitUnit::load`] turns relocatable object bytes into sealed
//! executable memory:
//!
//! 1. parse the object and lay out its allocatable sections
//! 2. copy section contents into a private [`UnitMemoryManager`]
//! 3. apply relocations, resolving imports only through the supplied map
//! 4. rebase exception tables (Windows only)
//! 5. flush the instruction cache and seal code read+execute
//! 6. build the symbol arena and publish it
//!
//! Publication happens once, after every step succeeded. A failed load
//! publishes nothing and releases everything it mapped.

use std::ops::Range;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use object::{Object, ObjectSection, ObjectSymbol, SectionIndex, SectionKind, SymbolKind as ObjectSymbolKind};
use tracing::{debug, info, warn};

use super::imports::{ImportBinding, ImportResolver, ImportedSymbolMap};
use super::memory::{MemoryLayout, Placement, RegionKind, UnitMemoryManager};
use super::naming::{external_name_of, function_index_from_external_name, invoke_thunk_name};
use super::op_map::{decode_op_maps, OffsetToOpIndexMap, OP_MAP_SECTION_NAME};
use super::relocate::{apply_relocations, defined_symbol_address, symbol_name, LoadedSection, SectionMap};
use super::symbol::{JitSymbol, SymbolHandle, SymbolKind, SymbolTable};
use super::types::{JitError, JitResult};
use super::unwind::{
    fix_up_unwind_tables, trampoline_stub, ExceptionTableStrategy, FunctionTableRegistration,
    RebasedFunctionTable, PDATA_SECTION_NAME, SEH_HANDLER_SYMBOL, TRAMPOLINE_SIZE,
    XDATA_SECTION_NAME,
};
use crate::ir::FunctionType;
use crate::runtime::FunctionInstance;

/// What a unit contains, fixed at construction
#[derive(Debug, Clone)]
pub enum UnitKind {
    /// A compiled module; `functions[i]` is definition `i`
    Module { functions: Vec<Arc<FunctionInstance>> },
    /// The invoke thunk for one function type
    InvokeThunk { function_type: FunctionType },
}

impl UnitKind {
    /// Attribute a loaded function symbol to this unit
    ///
    /// Returns `Ok(None)` for symbols that belong to neither a definition nor
    /// the thunk. A `functionDef<N>` with no definition `N` is an error.
    pub fn notify_symbol_loaded(
        &self,
        name: &str,
        base_address: usize,
        num_bytes: usize,
        offset_to_op_index: OffsetToOpIndexMap,
    ) -> JitResult<Option<JitSymbol>> {
        let kind = match self {
            UnitKind::Module { functions } => match function_index_from_external_name(name) {
                Some(index) => {
                    let instance = functions
                        .get(index)
                        .ok_or_else(|| JitError::UnknownFunctionSymbol(name.to_string()))?;
                    SymbolKind::FunctionInstance(Arc::clone(instance))
                }
                None => return Ok(None),
            },
            UnitKind::InvokeThunk { function_type } => {
                if name != invoke_thunk_name(function_type) {
                    return Ok(None);
                }
                SymbolKind::InvokeThunk(function_type.clone())
            }
        };
        Ok(Some(JitSymbol::new(
            name,
            kind,
            base_address,
            num_bytes,
            offset_to_op_index,
        )))
    }
}

/// Everything a successful load produced
struct LoadedImage {
    // Dropped before `memory`, which holds the registered table
    registration: Option<FunctionTableRegistration>,
    function_table: Option<RebasedFunctionTable>,
    symbols: SymbolTable,
    import_bindings: Vec<ImportBinding>,
    memory: UnitMemoryManager,
}

/// Compiled code of one module or thunk and its symbols
pub struct JitUnit {
    kind: UnitKind,
    exception_tables: ExceptionTableStrategy,
    image: OnceLock<LoadedImage>,
}

impl JitUnit {
    /// A unit handling exception tables the way this host requires
    pub fn new(kind: UnitKind) -> Self {
        Self::with_exception_tables(kind, ExceptionTableStrategy::host())
    }

    pub fn with_exception_tables(kind: UnitKind, exception_tables: ExceptionTableStrategy) -> Self {
        JitUnit {
            kind,
            exception_tables,
            image: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> &UnitKind {
        &self.kind
    }

    pub fn is_loaded(&self) -> bool {
        self.image.get().is_some()
    }

    /// Load `object_bytes`, resolving undefined symbols only through `imports`
    ///
    /// Succeeds at most once per unit; later calls fail with
    /// [`JitError::AlreadyLoaded`]. On failure nothing is published and the
    /// unit may be loaded again.
    pub fn load(
        &self,
        object_bytes: &[u8],
        imports: &ImportedSymbolMap,
        log_metrics: bool,
    ) -> JitResult<()> {
        if self.is_loaded() {
            return Err(JitError::AlreadyLoaded);
        }
        let start = Instant::now();

        let image = load_image(&self.kind, self.exception_tables, object_bytes, imports).map_err(|e| {
            warn!(target: "wasmjit::jit::load", error = %e, fatal = e.is_fatal(), "Unit load failed");
            e
        })?;

        let code_bytes = image.memory.code_range().len();
        let num_symbols = image.symbols.len();
        let num_imports = image.import_bindings.len();
        self.image.set(image).map_err(|_| JitError::AlreadyLoaded)?;

        if log_metrics {
            info!(
                target: "wasmjit::jit::load",
                object_bytes = object_bytes.len(),
                code_bytes,
                symbols = num_symbols,
                imports = num_imports,
                elapsed_us = start.elapsed().as_micros() as u64,
                "Loaded unit"
            );
        }
        Ok(())
    }

    /// Loaded symbols in ascending address order
    pub fn symbols(&self) -> impl Iterator<Item = (SymbolHandle, &JitSymbol)> {
        self.image.get().into_iter().flat_map(|image| image.symbols.iter())
    }

    pub fn num_symbols(&self) -> usize {
        self.image.get().map_or(0, |image| image.symbols.len())
    }

    pub fn symbol(&self, handle: SymbolHandle) -> Option<&JitSymbol> {
        self.image.get()?.symbols.get(handle)
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<&JitSymbol> {
        let symbols = &self.image.get()?.symbols;
        symbols.get(symbols.find_by_name(name)?)
    }

    /// Symbol of definition `def_index` in a module unit
    pub fn function_symbol(&self, def_index: usize) -> Option<&JitSymbol> {
        self.lookup_symbol(&external_name_of(def_index))
    }

    /// The thunk symbol of an invoke-thunk unit
    pub fn invoke_thunk_symbol(&self) -> Option<&JitSymbol> {
        match &self.kind {
            UnitKind::InvokeThunk { function_type } => {
                self.lookup_symbol(&invoke_thunk_name(function_type))
            }
            UnitKind::Module { .. } => None,
        }
    }

    /// Symbol whose code contains `address`
    ///
    /// Lock-free and allocation-free.
    #[inline]
    pub fn symbol_for_address(&self, address: usize) -> Option<&JitSymbol> {
        let symbols = &self.image.get()?.symbols;
        symbols.get(symbols.find_by_address(address)?)
    }

    /// Operation index of the code at `address`
    #[inline]
    pub fn op_index_for_address(&self, address: usize) -> Option<u32> {
        self.symbol_for_address(address)?.op_index_at(address)
    }

    /// Address range of the sealed code region
    pub fn code_range(&self) -> Option<Range<usize>> {
        Some(self.image.get()?.memory.code_range())
    }

    /// Every relocation that was resolved through the import map
    pub fn import_bindings(&self) -> &[ImportBinding] {
        self.image
            .get()
            .map_or(&[][..], |image| image.import_bindings.as_slice())
    }

    pub fn has_registered_exception_tables(&self) -> bool {
        self.image
            .get()
            .is_some_and(|image| image.registration.is_some())
    }

    /// The rebased `.pdata` entries, when the unit carried any
    pub fn function_table(&self) -> Option<RebasedFunctionTable> {
        self.image.get()?.function_table
    }
}

impl std::fmt::Debug for JitUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitUnit")
            .field("kind", &self.kind)
            .field("exception_tables", &self.exception_tables)
            .field("loaded", &self.is_loaded())
            .field("symbols", &self.num_symbols())
            .finish()
    }
}

// =============================================================================
// Loading
// =============================================================================

fn region_for(kind: SectionKind) -> Option<RegionKind> {
    match kind {
        SectionKind::Text
        | SectionKind::ReadOnlyData
        | SectionKind::ReadOnlyDataWithRel
        | SectionKind::ReadOnlyString => Some(RegionKind::Code),
        SectionKind::Data | SectionKind::UninitializedData => Some(RegionKind::Data),
        _ => None,
    }
}

fn object_error(e: object::Error) -> JitError {
    JitError::ObjectParse(e.to_string())
}

fn load_image(
    kind: &UnitKind,
    strategy: ExceptionTableStrategy,
    object_bytes: &[u8],
    imports: &ImportedSymbolMap,
) -> JitResult<LoadedImage> {
    let file = object::File::parse(object_bytes).map_err(object_error)?;
    let resolver = ImportResolver::new(imports);

    // Layout
    let mut layout = MemoryLayout::new();
    let mut placed: Vec<(SectionIndex, LoadedSection, SectionKind)> = Vec::new();
    let mut pdata = None;
    let mut xdata = None;
    let mut code_section = None;

    for section in file.sections() {
        let name = section.name().unwrap_or("");
        if name == OP_MAP_SECTION_NAME {
            continue;
        }
        let Some(region) = region_for(section.kind()) else {
            continue;
        };
        let size = usize::try_from(section.size())
            .map_err(|_| JitError::ObjectParse(format!("section {} is too large", name)))?;
        let placement = layout.reserve(region, size, section.align() as usize);
        let loaded = LoadedSection {
            placement,
            object_address: section.address(),
        };
        placed.push((section.index(), loaded, section.kind()));

        match name {
            PDATA_SECTION_NAME => pdata = Some(section.index()),
            XDATA_SECTION_NAME => xdata = Some(section.index()),
            _ if section.kind() == SectionKind::Text && code_section.is_none() => {
                code_section = Some(section.index())
            }
            _ => {}
        }
    }

    let process_unwind = strategy.is_supported() && pdata.is_some() && xdata.is_some();
    let trampoline = if process_unwind {
        Some(layout.reserve(RegionKind::Code, TRAMPOLINE_SIZE, 16))
    } else {
        None
    };

    // Copy
    let mut memory = UnitMemoryManager::allocate(&layout)?;
    let mut sections = SectionMap::with_capacity(placed.len());
    for (index, loaded, section_kind) in placed {
        if section_kind != SectionKind::UninitializedData {
            let section = file.section_by_index(index).map_err(object_error)?;
            let data = section.data().map_err(object_error)?;
            memory.write_section(&loaded.placement, data)?;
        }
        sections.insert(index, loaded);
    }
    let image_base = memory.base_address(RegionKind::Code);

    // Relocate
    let mut import_bindings =
        apply_relocations(&file, &sections, &mut memory, &resolver, image_base)?;

    // Exception tables
    let mut function_table = None;
    if let (true, Some(pdata), Some(xdata), Some(trampoline)) = (process_unwind, pdata, xdata, trampoline) {
        let code = code_section
            .and_then(|index| sections.get(&index))
            .ok_or_else(|| JitError::MalformedUnwindTable("no code section for .pdata".to_string()))?;
        let code_address = memory.address_of(&code.placement);
        let pdata = sections[&pdata].placement;
        let xdata = sections[&xdata].placement;

        let mut pdata_copy = memory.bytes_mut(pdata.region, pdata.offset, pdata.size)?.to_vec();
        let mut xdata_copy = memory.bytes_mut(xdata.region, xdata.offset, xdata.size)?.to_vec();
        let trampoline_address = memory.address_of(&trampoline);
        let fixup = fix_up_unwind_tables(
            image_base,
            code_address,
            &mut pdata_copy,
            memory.address_of(&xdata),
            &mut xdata_copy,
            trampoline_address,
        )?;
        memory.write_section(&pdata, &pdata_copy)?;
        memory.write_section(&xdata, &xdata_copy)?;

        if fixup.handlers_redirected > 0 {
            let handler = resolver.resolve(SEH_HANDLER_SYMBOL)?;
            memory.write_section(&trampoline, &trampoline_stub(handler as u64))?;
            import_bindings.push(ImportBinding {
                name: SEH_HANDLER_SYMBOL.to_string(),
                address: handler,
                patch_address: trampoline_address + 6,
            });
        }
        function_table = Some(RebasedFunctionTable {
            address: memory.address_of(&pdata),
            num_functions: fixup.num_functions,
            image_base,
        });
    }

    // Seal
    memory.seal_code()?;

    let registration = match function_table {
        Some(table) if table.num_functions > 0 && strategy.registers_with_os() => {
            // SAFETY: the table lives in the code region owned by the same image
            // and is dropped after the registration.
            Some(unsafe {
                FunctionTableRegistration::register(
                    table.address as *const u8,
                    table.num_functions,
                    table.image_base,
                )?
            })
        }
        _ => None,
    };

    // Symbols
    let mut op_maps = match file.section_by_name(OP_MAP_SECTION_NAME) {
        Some(section) => decode_op_maps(section.data().map_err(object_error)?)?,
        None => Default::default(),
    };

    let mut symbols = Vec::new();
    for function in function_symbols(&file, &sections, &memory)? {
        let map = op_maps.remove(function.name).unwrap_or_default();
        if let Some(symbol) =
            kind.notify_symbol_loaded(function.name, function.address, function.size, map)?
        {
            debug!(target: "wasmjit::jit::load", symbol = %symbol, "Loaded symbol");
            symbols.push(symbol);
        }
    }

    if let UnitKind::InvokeThunk { function_type } = kind {
        if symbols.is_empty() {
            return Err(JitError::UnknownFunctionSymbol(invoke_thunk_name(function_type)));
        }
    }

    Ok(LoadedImage {
        registration,
        function_table,
        symbols: SymbolTable::build(symbols)?,
        import_bindings,
        memory,
    })
}

struct FunctionSymbol<'data> {
    name: &'data str,
    section: SectionIndex,
    address: usize,
    size: usize,
}

/// Defined text symbols of loaded sections with their loaded addresses
///
/// Formats without symbol sizes get the distance to the next symbol (or the
/// section end) instead.
fn function_symbols<'data>(
    file: &object::File<'data>,
    sections: &SectionMap,
    memory: &UnitMemoryManager,
) -> JitResult<Vec<FunctionSymbol<'data>>> {
    let mut functions = Vec::new();
    for symbol in file.symbols() {
        if !symbol.is_definition() || symbol.kind() != ObjectSymbolKind::Text {
            continue;
        }
        let Some(section) = symbol.section_index() else {
            continue;
        };
        let Some(address) = defined_symbol_address(symbol.address(), section, sections, memory)
        else {
            continue;
        };
        let name = symbol_name(file, symbol.name().map_err(object_error)?);
        functions.push(FunctionSymbol {
            name,
            section,
            address,
            size: symbol.size() as usize,
        });
    }

    functions.sort_by_key(|f| f.address);
    for i in 0..functions.len() {
        if functions[i].size != 0 {
            continue;
        }
        let section_end = sections
            .get(&functions[i].section)
            .map(|s| section_end(memory, &s.placement))
            .unwrap_or(functions[i].address);
        let next = functions[i + 1..]
            .iter()
            .find(|f| f.section == functions[i].section)
            .map_or(section_end, |f| f.address);
        functions[i].size = next.saturating_sub(functions[i].address);
    }
    Ok(functions)
}

fn section_end(memory: &UnitMemoryManager, placement: &Placement) -> usize {
    memory.address_of(placement) + placement.size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueType;
    use crate::jit::unwind::{
        RuntimeFunction, UnwindTableBuilder, RUNTIME_FUNCTION_SIZE, UNW_FLAG_EHANDLER,
        UNW_FLAG_UHANDLER,
    };
    use cranelift_object::object as obj;
    use obj::write::{
        Object as ObjectWriter, SectionId, StandardSection, StandardSegment, Symbol as WriteSymbol,
        SymbolId, SymbolSection as WriteSymbolSection,
    };

    const FUNCTION_SIZE: usize = 16;

    fn module_kind(count: usize) -> UnitKind {
        UnitKind::Module {
            functions: (0..count)
                .map(|i| {
                    Arc::new(FunctionInstance::new(
                        i,
                        format!("f{}", i),
                        FunctionType::new(vec![ValueType::I32], vec![ValueType::I32]),
                    ))
                })
                .collect(),
        }
    }

    #[test]
    fn test_module_notify_attributes_definitions() {
        let kind = module_kind(2);
        let symbol = kind
            .notify_symbol_loaded("functionDef1", 0x1000, 16, OffsetToOpIndexMap::new())
            .unwrap()
            .unwrap();
        let instance = symbol.kind().function_instance().unwrap();
        assert_eq!(instance.def_index, 1);
        assert_eq!(symbol.base_address(), 0x1000);
    }

    #[test]
    fn test_module_notify_skips_foreign_symbols() {
        let kind = module_kind(1);
        assert!(kind
            .notify_symbol_loaded("memcpy", 0, 1, OffsetToOpIndexMap::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_module_notify_rejects_unknown_definition() {
        let kind = module_kind(1);
        let err = kind
            .notify_symbol_loaded("functionDef5", 0, 1, OffsetToOpIndexMap::new())
            .unwrap_err();
        assert_eq!(err, JitError::UnknownFunctionSymbol("functionDef5".into()));
    }

    #[test]
    fn test_thunk_notify() {
        let function_type = FunctionType::new(vec![ValueType::F64], vec![]);
        let name = invoke_thunk_name(&function_type);
        let kind = UnitKind::InvokeThunk { function_type };
        let symbol = kind
            .notify_symbol_loaded(&name, 0x40, 8, OffsetToOpIndexMap::new())
            .unwrap()
            .unwrap();
        assert!(symbol.kind().invoke_thunk_type().is_some());
        assert!(kind
            .notify_symbol_loaded("functionDef0", 0, 1, OffsetToOpIndexMap::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unloaded_unit_has_no_symbols() {
        let unit = JitUnit::new(module_kind(1));
        assert!(!unit.is_loaded());
        assert_eq!(unit.num_symbols(), 0);
        assert_eq!(unit.symbols().count(), 0);
        assert!(unit.symbol_for_address(0x1000).is_none());
        assert!(unit.code_range().is_none());
        assert!(unit.import_bindings().is_empty());
    }

    fn define_function(writer: &mut ObjectWriter, section: SectionId, name: &str) -> SymbolId {
        let offset = writer.append_section_data(section, &[0xc3; FUNCTION_SIZE], 16);
        writer.add_symbol(WriteSymbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: FUNCTION_SIZE as u64,
            kind: obj::SymbolKind::Text,
            scope: obj::SymbolScope::Linkage,
            weak: false,
            section: WriteSymbolSection::Section(section),
            flags: obj::SymbolFlags::None,
        })
    }

    /// ELF object with two functions and Win64 `.pdata`/`.xdata`
    fn object_with_exception_tables() -> Vec<u8> {
        let mut writer = ObjectWriter::new(
            obj::BinaryFormat::Elf,
            obj::Architecture::X86_64,
            obj::Endianness::Little,
        );
        let text = writer.section_id(StandardSection::Text);
        define_function(&mut writer, text, "functionDef0");
        define_function(&mut writer, text, "functionDef1");

        // push rbp; sub rsp, 0x28
        let unwind_info = [1, 4, 2, 0, 0x04, 0x42, 0x01, 0x50];
        let mut tables = UnwindTableBuilder::new();
        tables.add_function(0, FUNCTION_SIZE as u32, &unwind_info);
        tables.add_function(FUNCTION_SIZE as u32, FUNCTION_SIZE as u32, &unwind_info);
        let (pdata, xdata) = tables.finish();

        let segment = writer.segment_name(StandardSegment::Data).to_vec();
        for (name, contents) in [(PDATA_SECTION_NAME, pdata), (XDATA_SECTION_NAME, xdata)] {
            let section = writer.add_section(
                segment.clone(),
                name.as_bytes().to_vec(),
                obj::SectionKind::ReadOnlyData,
            );
            writer.append_section_data(section, &contents, 4);
        }
        writer.write().unwrap()
    }

    /// Bytes of the sealed code region of `unit`
    fn code_bytes(unit: &JitUnit, address: usize, len: usize) -> &[u8] {
        let code = unit.code_range().unwrap();
        assert!(code.start <= address && address + len <= code.end);
        // SAFETY: in bounds of the code region, which stays mapped while `unit` lives.
        unsafe { std::slice::from_raw_parts(address as *const u8, len) }
    }

    extern "C" fn seh_handler() {}

    #[test]
    fn test_exception_tables_rebased_before_sealing() {
        let unit = JitUnit::with_exception_tables(
            module_kind(2),
            ExceptionTableStrategy::WindowsSehRebaseOnly,
        );
        let handler = seh_handler as usize;
        let mut imports = ImportedSymbolMap::new();
        imports.insert(SEH_HANDLER_SYMBOL.to_string(), handler);
        unit.load(&object_with_exception_tables(), &imports, false).unwrap();

        assert!(!unit.has_registered_exception_tables());
        let table = unit.function_table().unwrap();
        assert_eq!(table.num_functions, 2);
        assert_eq!(table.image_base, unit.code_range().unwrap().start);

        let binding = unit
            .import_bindings()
            .iter()
            .find(|binding| binding.name == SEH_HANDLER_SYMBOL)
            .unwrap();
        assert_eq!(binding.address, handler);
        let trampoline = binding.patch_address - 6;
        assert_eq!(trampoline % 16, 0);
        assert_eq!(code_bytes(&unit, trampoline, TRAMPOLINE_SIZE), trampoline_stub(handler as u64));
        let trampoline_rva = (trampoline - table.image_base) as u32;

        let entries = code_bytes(&unit, table.address, table.num_functions * RUNTIME_FUNCTION_SIZE);
        for (index, entry) in entries.chunks_exact(RUNTIME_FUNCTION_SIZE).enumerate() {
            let entry = RuntimeFunction::read(entry);
            let symbol = unit.function_symbol(index).unwrap();
            assert_eq!(entry.begin as usize, symbol.base_address() - table.image_base);
            assert_eq!((entry.end - entry.begin) as usize, FUNCTION_SIZE);

            // Header, two unwind codes, then the handler RVA
            let info = code_bytes(&unit, table.image_base + entry.unwind_info as usize, 12);
            assert_eq!(info[0] >> 3, UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER);
            assert_eq!(u32::from_le_bytes(info[8..12].try_into().unwrap()), trampoline_rva);
        }
    }

    #[test]
    fn test_exception_tables_require_handler_import() {
        let unit = JitUnit::with_exception_tables(
            module_kind(2),
            ExceptionTableStrategy::WindowsSehRebaseOnly,
        );
        let err = unit
            .load(&object_with_exception_tables(), &ImportedSymbolMap::new(), false)
            .unwrap_err();
        assert_eq!(err, JitError::UnresolvedImport(SEH_HANDLER_SYMBOL.to_string()));
        assert!(!unit.is_loaded());
        assert!(unit.function_table().is_none());
    }

    #[test]
    fn test_exception_tables_skipped_when_unsupported() {
        let unit = JitUnit::with_exception_tables(module_kind(2), ExceptionTableStrategy::Unsupported);
        unit.load(&object_with_exception_tables(), &ImportedSymbolMap::new(), false)
            .unwrap();
        assert!(unit.function_table().is_none());
        assert!(unit.import_bindings().is_empty());
        assert_eq!(unit.num_symbols(), 2);
    }

    #[test]
    fn test_relocation_in_section_at_nonzero_address() {
        let mut writer = ObjectWriter::new(
            obj::BinaryFormat::MachO,
            obj::Architecture::X86_64,
            obj::Endianness::Little,
        );
        let text = writer.section_id(StandardSection::Text);
        let function = define_function(&mut writer, text, "functionDef0");
        let data = writer.section_id(StandardSection::Data);
        let offset = writer.append_section_data(data, &[0u8; 16], 8);
        writer
            .add_relocation(
                data,
                obj::write::Relocation {
                    offset: offset + 8,
                    symbol: function,
                    addend: 0,
                    flags: obj::RelocationFlags::Generic {
                        kind: obj::RelocationKind::Absolute,
                        encoding: obj::RelocationEncoding::Generic,
                        size: 64,
                    },
                },
            )
            .unwrap();
        let bytes = writer.write().unwrap();

        // `__data` follows `__text` in the object's address space
        let file = object::File::parse(&*bytes).unwrap();
        assert_ne!(file.section_by_name("__data").unwrap().address(), 0);

        let mut image = load_image(
            &module_kind(1),
            ExceptionTableStrategy::Unsupported,
            &bytes,
            &ImportedSymbolMap::new(),
        )
        .unwrap();
        let handle = image.symbols.find_by_name("functionDef0").unwrap();
        let function_address = image.symbols.get(handle).unwrap().base_address();
        let pointer = image.memory.bytes_mut(RegionKind::Data, 8, 8).unwrap();
        assert_eq!(u64::from_le_bytes(pointer.try_into().unwrap()), function_address as u64);
    }

    #[test]
    fn test_garbage_object_fails_to_load() {
        let unit = JitUnit::new(module_kind(0));
        let err = unit
            .load(b"not an object", &ImportedSymbolMap::new(), false)
            .unwrap_err();
        assert!(matches!(err, JitError::ObjectParse(_)));
        assert!(!unit.is_loaded());
    }
}
