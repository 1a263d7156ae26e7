//! WebAssembly Intermediate Representation (IR)
//!
//! This module defines the already-validated IR consumed by the native
//! code generation bridge. Parsing and full validation happen upstream; the
//! types here only carry what lowering and emission need: value types,
//! function types, imports, and straight-line function bodies.

use std::fmt;
use std::ops::Index;

use crate::jit::types::{JitError, JitResult};
use crate::runtime::CallingConvention;

/// Primitive WebAssembly value kinds
///
/// The discriminant is a dense index into fixed-size lookup tables
/// (native type table, zero-constant table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
    V128 = 4,
    AnyRef = 5,
    FuncRef = 6,
}

impl ValueType {
    /// Number of value kinds (size of every per-type table)
    pub const COUNT: usize = 7;

    /// Every value kind in index order
    pub const ALL: [ValueType; ValueType::COUNT] = [
        ValueType::I32,
        ValueType::I64,
        ValueType::F32,
        ValueType::F64,
        ValueType::V128,
        ValueType::AnyRef,
        ValueType::FuncRef,
    ];

    /// Dense table index for this kind
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short textual name, as written in the WebAssembly text format
    pub const fn name(self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::V128 => "v128",
            ValueType::AnyRef => "anyref",
            ValueType::FuncRef => "funcref",
        }
    }

    /// Whether values of this kind are references (lowered to pointers)
    pub const fn is_reference(self) -> bool {
        matches!(self, ValueType::AnyRef | ValueType::FuncRef)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 128-bit SIMD value, stored as two little-endian 64-bit lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct V128 {
    pub u64: [u64; 2],
}

impl V128 {
    pub const fn from_u64x2(lo: u64, hi: u64) -> Self {
        V128 { u64: [lo, hi] }
    }

    /// Little-endian byte image of the value
    pub fn to_le_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.u64[0].to_le_bytes());
        bytes[8..].copy_from_slice(&self.u64[1].to_le_bytes());
        bytes
    }
}

/// Ordered sequence of value types (argument or result list)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeTuple(Vec<ValueType>);

impl TypeTuple {
    pub fn new(types: impl Into<Vec<ValueType>>) -> Self {
        TypeTuple(types.into())
    }

    pub fn empty() -> Self {
        TypeTuple(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ValueType> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ValueType] {
        &self.0
    }
}

impl Index<usize> for TypeTuple {
    type Output = ValueType;

    fn index(&self, index: usize) -> &ValueType {
        &self.0[index]
    }
}

impl From<Vec<ValueType>> for TypeTuple {
    fn from(types: Vec<ValueType>) -> Self {
        TypeTuple(types)
    }
}

impl From<&[ValueType]> for TypeTuple {
    fn from(types: &[ValueType]) -> Self {
        TypeTuple(types.to_vec())
    }
}

impl<'a> IntoIterator for &'a TypeTuple {
    type Item = &'a ValueType;
    type IntoIter = std::slice::Iter<'a, ValueType>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for TypeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, ty) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, ")")
    }
}

/// Function signature: ordered params and ordered results
///
/// Identity is structural; two equal function types are interchangeable
/// for ABI purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionType {
    params: TypeTuple,
    results: TypeTuple,
}

impl FunctionType {
    pub fn new(params: impl Into<TypeTuple>, results: impl Into<TypeTuple>) -> Self {
        FunctionType {
            params: params.into(),
            results: results.into(),
        }
    }

    pub fn params(&self) -> &TypeTuple {
        &self.params
    }

    pub fn results(&self) -> &TypeTuple {
        &self.results
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.params, self.results)
    }
}

/// Straight-line WebAssembly operators understood by the emitter
///
/// Operands are taken from and pushed to an implicit value stack. A body
/// ends with an implicit return of the values left on the stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    V128Const(V128),

    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),

    I32Add,
    I32Sub,
    I32Mul,
    /// Unsigned division; traps on a zero divisor
    I32DivU,
    I64Add,
    I64Sub,
    I64Mul,
    F32Add,
    F32Mul,
    F64Add,
    F64Mul,

    /// Call by function index (imports first, then definitions)
    Call(u32),
    Drop,
    Unreachable,
}

/// An imported function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionImport {
    /// Name of the import, for diagnostics only
    pub name: String,
    pub ty: FunctionType,
    /// Convention the callee was compiled or written with
    pub calling_convention: CallingConvention,
    /// Memory passed to `IntrinsicWithMemAndTable` callees
    pub memory_index: usize,
    /// Table passed to `IntrinsicWithMemAndTable` callees
    pub table_index: usize,
}

impl FunctionImport {
    pub fn new(
        name: impl Into<String>,
        ty: FunctionType,
        calling_convention: CallingConvention,
    ) -> Self {
        FunctionImport {
            name: name.into(),
            ty,
            calling_convention,
            memory_index: 0,
            table_index: 0,
        }
    }

    /// Set the memory and table forwarded to a mem-and-table intrinsic
    pub fn with_memory_and_table(mut self, memory_index: usize, table_index: usize) -> Self {
        self.memory_index = memory_index;
        self.table_index = table_index;
        self
    }
}

/// A function defined by the module
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub ty: FunctionType,
    /// Non-parameter locals, zero-initialized on entry
    pub locals: Vec<ValueType>,
    pub body: Vec<Operator>,
    /// Name used in logs and trap reports
    pub debug_name: String,
}

impl FunctionDef {
    pub fn new(ty: FunctionType, body: Vec<Operator>) -> Self {
        FunctionDef {
            ty,
            locals: Vec::new(),
            body,
            debug_name: String::new(),
        }
    }

    pub fn with_locals(mut self, locals: Vec<ValueType>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }

    /// Total locals visible to the body (params first)
    pub fn num_locals(&self) -> usize {
        self.ty.params().len() + self.locals.len()
    }

    /// Type of local `index` (params first, then declared locals)
    pub fn local_type(&self, index: usize) -> Option<ValueType> {
        let num_params = self.ty.params().len();
        if index < num_params {
            Some(self.ty.params()[index])
        } else {
            self.locals.get(index - num_params).copied()
        }
    }
}

/// A validated module: imports followed by definitions in one index space
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrModule {
    pub imports: Vec<FunctionImport>,
    pub functions: Vec<FunctionDef>,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an import, returning its function index
    ///
    /// Imports precede definitions in the index space, so this fails once
    /// any definition has been added.
    pub fn add_import(&mut self, import: FunctionImport) -> JitResult<u32> {
        if !self.functions.is_empty() {
            return Err(JitError::InvalidModule(format!(
                "import {} declared after {} definitions",
                import.name,
                self.functions.len()
            )));
        }
        self.imports.push(import);
        Ok((self.imports.len() - 1) as u32)
    }

    /// Add a definition, returning its function index
    pub fn add_function(&mut self, def: FunctionDef) -> u32 {
        self.functions.push(def);
        (self.imports.len() + self.functions.len() - 1) as u32
    }

    /// Number of functions in the index space
    pub fn num_functions(&self) -> usize {
        self.imports.len() + self.functions.len()
    }

    /// Type of the function at `function_index`
    pub fn function_type(&self, function_index: usize) -> Option<&FunctionType> {
        if function_index < self.imports.len() {
            Some(&self.imports[function_index].ty)
        } else {
            self.functions
                .get(function_index - self.imports.len())
                .map(|def| &def.ty)
        }
    }

    /// Structural checks emission relies on
    ///
    /// Stack typing is the producer's responsibility; this only rejects
    /// indices that would make emission read out of bounds.
    pub fn validate_shape(&self) -> JitResult<()> {
        let num_functions = self.num_functions();
        for (def_index, def) in self.functions.iter().enumerate() {
            for op in &def.body {
                match *op {
                    Operator::Call(index) if index as usize >= num_functions => {
                        return Err(JitError::InvalidModule(format!(
                            "functionDef{} calls function {} of {}",
                            def_index, index, num_functions
                        )));
                    }
                    Operator::LocalGet(index)
                    | Operator::LocalSet(index)
                    | Operator::LocalTee(index)
                        if index as usize >= def.num_locals() =>
                    {
                        return Err(JitError::InvalidModule(format!(
                            "functionDef{} accesses local {} of {}",
                            def_index,
                            index,
                            def.num_locals()
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_indices_are_dense() {
        for (i, ty) in ValueType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
    }

    #[test]
    fn test_function_type_display() {
        let ty = FunctionType::new(vec![ValueType::I32, ValueType::F64], vec![ValueType::I64]);
        assert_eq!(ty.to_string(), "(i32, f64)->(i64)");
    }

    #[test]
    fn test_function_index_space() {
        let mut module = IrModule::new();
        let sig = FunctionType::new(vec![ValueType::I32], vec![ValueType::I32]);
        let import = module
            .add_import(FunctionImport::new("env.f", sig.clone(), CallingConvention::C))
            .unwrap();
        let def = module.add_function(FunctionDef::new(sig.clone(), vec![Operator::LocalGet(0)]));

        assert_eq!(import, 0);
        assert_eq!(def, 1);
        assert_eq!(module.function_type(1), Some(&sig));
        assert_eq!(module.function_type(2), None);
    }

    #[test]
    fn test_import_after_definition_is_rejected() {
        let mut module = IrModule::new();
        let sig = FunctionType::new(vec![], vec![ValueType::I32]);
        module.add_function(FunctionDef::new(sig.clone(), vec![Operator::I32Const(0)]));

        let result = module.add_import(FunctionImport::new("env.late", sig, CallingConvention::C));
        assert!(matches!(result, Err(JitError::InvalidModule(_))));
        assert!(module.imports.is_empty());
        assert_eq!(module.num_functions(), 1);
    }

    #[test]
    fn test_validate_shape_rejects_bad_call() {
        let mut module = IrModule::new();
        module.add_function(FunctionDef::new(FunctionType::default(), vec![Operator::Call(3)]));
        assert!(matches!(module.validate_shape(), Err(JitError::InvalidModule(_))));
    }

    #[test]
    fn test_validate_shape_rejects_bad_local() {
        let mut module = IrModule::new();
        let def = FunctionDef::new(FunctionType::new(vec![ValueType::I32], vec![]), vec![Operator::LocalGet(1)]);
        module.add_function(def);
        assert!(module.validate_shape().is_err());

        let mut module = IrModule::new();
        let def = FunctionDef::new(FunctionType::new(vec![ValueType::I32], vec![]), vec![Operator::LocalGet(1)])
            .with_locals(vec![ValueType::I64]);
        module.add_function(def);
        assert!(module.validate_shape().is_ok());
    }

    #[test]
    fn test_v128_bytes_are_little_endian() {
        let v = V128::from_u64x2(1, 2);
        let bytes = v.to_le_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 2);
    }
}
