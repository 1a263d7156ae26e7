//! End-to-end tests: IR → object bytes → loaded unit → execution through
//! invoke thunks.

mod common;

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use common::{backend, invoke, invoke_in, load_module, load_thunk, Slot};
use wasmjit::ir::{FunctionDef, FunctionImport, FunctionType, IrModule, Operator, ValueType};
use wasmjit::jit::unwind::SEH_HANDLER_SYMBOL;
use wasmjit::jit::{ImportedSymbolMap, SymbolKind};
use wasmjit::runtime::{CallingConvention, ContextRuntimeData};

use Operator::*;
use ValueType::{F64, I32, I64};

fn func(params: &[ValueType], results: &[ValueType]) -> FunctionType {
    FunctionType::new(params.to_vec(), results.to_vec())
}

// ============================================================================
// Arithmetic and locals
// ============================================================================

#[test]
fn test_add_through_invoke_thunk() {
    let backend = backend();
    let ty = func(&[I32, I32], &[I32]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0), LocalGet(1), I32Add]));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &ty);

    let callee = unit.function_symbol(0).unwrap().base_address();
    let call = invoke(&thunk, callee, &[Slot::i32(40), Slot::i32(2)], 1);
    assert_eq!(call.results[0].as_i32(), 42);

    let call = invoke(&thunk, callee, &[Slot::i32(i32::MAX), Slot::i32(1)], 1);
    assert_eq!(call.results[0].as_i32(), i32::MIN);
}

#[test]
fn test_locals_and_i64_arithmetic() {
    let backend = backend();
    let ty = func(&[I64], &[I64]);
    let mut module = IrModule::new();
    // local1 = x * 3; local1 + local1
    module.add_function(
        FunctionDef::new(
            ty.clone(),
            vec![LocalGet(0), I64Const(3), I64Mul, LocalTee(1), LocalGet(1), I64Add],
        )
        .with_locals(vec![I64]),
    );

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let call = invoke(&thunk, callee, &[Slot::i64(7)], 1);
    assert_eq!(call.results[0].as_i64(), 42);
}

#[test]
fn test_declared_locals_start_at_zero() {
    let backend = backend();
    let ty = func(&[], &[I32]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0)]).with_locals(vec![I32]));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    assert_eq!(invoke(&thunk, callee, &[], 1).results[0].as_i32(), 0);
}

#[test]
fn test_unsigned_division() {
    let backend = backend();
    let ty = func(&[I32, I32], &[I32]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0), LocalGet(1), I32DivU]));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let call = invoke(&thunk, callee, &[Slot::i32(-2), Slot::i32(2)], 1);
    assert_eq!(call.results[0].as_i32() as u32, u32::MAX / 2);
}

#[test]
fn test_float_arithmetic() {
    let backend = backend();
    let ty = func(&[F64], &[F64]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(
        ty.clone(),
        vec![LocalGet(0), F64Const(1.5), F64Mul, F64Const(0.25), F64Add],
    ));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let call = invoke(&thunk, callee, &[Slot::f64(2.0)], 1);
    assert_eq!(call.results[0].as_f64(), 3.25);
}

// ============================================================================
// Results returned through the context
// ============================================================================

#[test]
fn test_indirect_results() {
    let backend = backend();
    let ty = func(&[], &[I64, F64, I32]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(
        ty.clone(),
        vec![I64Const(-7), F64Const(2.5), I32Const(9)],
    ));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let mut context = Box::new(ContextRuntimeData::new());
    let ctx = context.as_context_ptr();
    let call = invoke_in(&thunk, callee, ctx, &[], 3);

    assert_eq!(call.context, ctx);
    assert_eq!(call.results[0].as_i64(), -7);
    assert_eq!(call.results[1].as_f64(), 2.5);
    assert_eq!(call.results[2].as_i32(), 9);
    // The results went through the context's return area
    assert_eq!(context.thunk_arg_and_return_data[32..36], 9i32.to_ne_bytes());
}

#[test]
fn test_wasm_call_with_indirect_results() {
    let backend = backend();
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(
        func(&[], &[I64, I64, I64]),
        vec![I64Const(1), I64Const(2), I64Const(3)],
    ));
    // Keep only the first result
    let caller_ty = func(&[], &[I64]);
    module.add_function(FunctionDef::new(caller_ty.clone(), vec![Call(0), Drop, Drop]));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &caller_ty);
    let callee = unit.function_symbol(1).unwrap().base_address();

    assert_eq!(invoke(&thunk, callee, &[], 1).results[0].as_i64(), 1);
}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn test_wasm_to_wasm_call() {
    let backend = backend();
    let add = func(&[I32, I32], &[I32]);
    let add_ten = func(&[I32], &[I32]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(add, vec![LocalGet(0), LocalGet(1), I32Add]));
    module.add_function(FunctionDef::new(add_ten.clone(), vec![LocalGet(0), I32Const(10), Call(0)]));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let thunk = load_thunk(&backend, &add_ten);
    let callee = unit.function_symbol(1).unwrap().base_address();

    assert_eq!(invoke(&thunk, callee, &[Slot::i32(5)], 1).results[0].as_i32(), 15);
}

extern "C" fn host_mul(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b)
}

#[test]
fn test_c_import_call() {
    let backend = backend();
    let ty = func(&[I32, I32], &[I32]);
    let mut module = IrModule::new();
    module
        .add_import(FunctionImport::new("env.mul", ty.clone(), CallingConvention::C))
        .unwrap();
    module.add_function(FunctionDef::new(
        ty.clone(),
        vec![LocalGet(0), LocalGet(1), Call(0), I32Const(1), I32Add],
    ));

    let mut imports = ImportedSymbolMap::new();
    imports.insert("functionImport0".to_string(), host_mul as usize);

    let unit = load_module(&backend, &module, &imports);
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let call = invoke(&thunk, callee, &[Slot::i32(6), Slot::i32(7)], 1);
    assert_eq!(call.results[0].as_i32(), 43);

    let bindings: Vec<_> = unit
        .import_bindings()
        .iter()
        .filter(|binding| binding.name != SEH_HANDLER_SYMBOL)
        .collect();
    assert!(!bindings.is_empty());
    for binding in bindings {
        assert_eq!(binding.name, "functionImport0");
        assert_eq!(binding.address, host_mul as usize);
    }
}

static INTRINSIC_CONTEXT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn host_intrinsic(ctx: *mut u8, value: i64) -> i64 {
    INTRINSIC_CONTEXT.store(ctx as usize, Ordering::SeqCst);
    value + 100
}

#[test]
fn test_intrinsic_receives_context() {
    let backend = backend();
    let ty = func(&[I64], &[I64]);
    let mut module = IrModule::new();
    module
        .add_import(FunctionImport::new("env.intrinsic", ty.clone(), CallingConvention::Intrinsic))
        .unwrap();
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0), Call(0)]));

    let mut imports = ImportedSymbolMap::new();
    imports.insert("functionImport0".to_string(), host_intrinsic as usize);

    let unit = load_module(&backend, &module, &imports);
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let mut context = Box::new(ContextRuntimeData::new());
    let ctx = context.as_context_ptr();
    let call = invoke_in(&thunk, callee, ctx, &[Slot::i64(1)], 1);

    assert_eq!(call.results[0].as_i64(), 101);
    assert_eq!(INTRINSIC_CONTEXT.load(Ordering::SeqCst), ctx as usize);
}

static MEMORY_ID: AtomicI64 = AtomicI64::new(-1);
static TABLE_ID: AtomicI64 = AtomicI64::new(-1);

extern "C" fn host_mem_and_table(_ctx: *mut u8, memory_id: i64, table_id: i64, value: i32) -> i32 {
    MEMORY_ID.store(memory_id, Ordering::SeqCst);
    TABLE_ID.store(table_id, Ordering::SeqCst);
    value * 2
}

#[test]
fn test_mem_and_table_intrinsic_receives_ids() {
    let backend = backend();
    let ty = func(&[I32], &[I32]);
    let mut module = IrModule::new();
    module
        .add_import(
            FunctionImport::new("env.grow", ty.clone(), CallingConvention::IntrinsicWithMemAndTable)
                .with_memory_and_table(3, 5),
        )
        .unwrap();
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0), Call(0)]));

    let mut imports = ImportedSymbolMap::new();
    imports.insert("functionImport0".to_string(), host_mem_and_table as usize);

    let unit = load_module(&backend, &module, &imports);
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    assert_eq!(invoke(&thunk, callee, &[Slot::i32(21)], 1).results[0].as_i32(), 42);
    assert_eq!(MEMORY_ID.load(Ordering::SeqCst), 3);
    assert_eq!(TABLE_ID.load(Ordering::SeqCst), 5);
}

static SWITCH_TARGET: AtomicPtr<ContextRuntimeData> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn host_switch(_ctx: *mut u8) -> *mut u8 {
    let target = SWITCH_TARGET.load(Ordering::SeqCst);
    unsafe {
        (&mut (*target).thunk_arg_and_return_data)[..4].copy_from_slice(&77i32.to_ne_bytes());
    }
    target as *mut u8
}

#[test]
fn test_context_switch_adopts_new_context() {
    let backend = backend();
    let ty = func(&[], &[I32]);
    let mut module = IrModule::new();
    module
        .add_import(FunctionImport::new(
            "env.switch",
            ty.clone(),
            CallingConvention::IntrinsicWithContextSwitch,
        ))
        .unwrap();
    module.add_function(FunctionDef::new(ty.clone(), vec![Call(0)]));

    let mut imports = ImportedSymbolMap::new();
    imports.insert("functionImport0".to_string(), host_switch as usize);

    let unit = load_module(&backend, &module, &imports);
    let thunk = load_thunk(&backend, &ty);
    let callee = unit.function_symbol(0).unwrap().base_address();

    let target = Box::into_raw(Box::new(ContextRuntimeData::new()));
    SWITCH_TARGET.store(target, Ordering::SeqCst);

    let call = invoke(&thunk, callee, &[], 1);
    assert_eq!(call.context, target as *mut u8);
    assert_eq!(call.results[0].as_i32(), 77);

    drop(unsafe { Box::from_raw(target) });
}

// ============================================================================
// Symbols
// ============================================================================

#[test]
fn test_symbols_describe_loaded_code() {
    let backend = backend();
    let ty = func(&[I32], &[I32]);
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0)]).with_debug_name("first"));
    module.add_function(FunctionDef::new(ty.clone(), vec![LocalGet(0), I32Const(1), I32Add]));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    assert_eq!(unit.num_symbols(), 2);

    let code = unit.code_range().unwrap();
    for def_index in 0..2 {
        let symbol = unit.function_symbol(def_index).unwrap();
        assert!(code.contains(&symbol.base_address()));
        assert!(symbol.num_bytes() > 0);
        assert!(symbol.end_address() <= code.end);

        let found = unit.symbol_for_address(symbol.base_address()).unwrap();
        assert_eq!(found.name(), symbol.name());
        let found = unit.symbol_for_address(symbol.end_address() - 1).unwrap();
        assert_eq!(found.name(), symbol.name());

        match symbol.kind() {
            SymbolKind::FunctionInstance(instance) => assert_eq!(instance.def_index, def_index),
            other => panic!("unexpected symbol kind {:?}", other),
        }
    }
    assert!(unit.symbol_for_address(code.start.wrapping_sub(1)).is_none());

    // Symbols are ordered by address
    let bases: Vec<usize> = unit.symbols().map(|(_, s)| s.base_address()).collect();
    assert!(bases.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_trap_address_maps_to_operation() {
    let backend = backend();
    let mut module = IrModule::new();
    module.add_function(FunctionDef::new(
        func(&[I32], &[I32]),
        vec![LocalGet(0), I32Const(2), I32Mul, Unreachable],
    ));

    let unit = load_module(&backend, &module, &ImportedSymbolMap::new());
    let symbol = unit.function_symbol(0).unwrap();

    let map = symbol.offset_to_op_index();
    assert!(!map.is_empty());
    for (offset, op_index) in map.iter() {
        let address = symbol.base_address() + offset as usize;
        assert_eq!(unit.op_index_for_address(address), Some(op_index));
    }
    // The trap is the last operation
    assert!(map.iter().any(|(_, op_index)| op_index == 3));
}

#[test]
fn test_invoke_thunk_symbol() {
    let backend = backend();
    let ty = func(&[I32, F64], &[I64]);
    let thunk = load_thunk(&backend, &ty);

    let symbol = thunk.invoke_thunk_symbol().unwrap();
    match symbol.kind() {
        SymbolKind::InvokeThunk(function_type) => assert_eq!(function_type, &ty),
        other => panic!("unexpected symbol kind {:?}", other),
    }
    assert!(thunk.function_symbol(0).is_none());
}
