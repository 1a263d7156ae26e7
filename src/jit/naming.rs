//! External symbol naming
//!
//! Functions defined by a module are exported as `functionDef<N>`; imported
//! functions are referenced as `functionImport<N>`. Decoding is the exact
//! inverse of encoding, so scanning an object's symbol table can tell wasm
//! definitions apart from thunks and host symbols.

use crate::ir::FunctionType;

const FUNCTION_DEF_PREFIX: &str = "functionDef";
const FUNCTION_IMPORT_PREFIX: &str = "functionImport";
const INVOKE_THUNK_PREFIX: &str = "invokeThunk_";

/// Externally visible name of function definition `function_def_index`
pub fn external_name_of(function_def_index: usize) -> String {
    format!("{}{}", FUNCTION_DEF_PREFIX, function_def_index)
}

/// Definition index encoded in `name`, or `None` for any other symbol
pub fn function_index_from_external_name(name: &str) -> Option<usize> {
    parse_index(name.strip_prefix(FUNCTION_DEF_PREFIX)?)
}

/// Symbol a module uses to reference import `import_index`
pub fn import_name_of(import_index: usize) -> String {
    format!("{}{}", FUNCTION_IMPORT_PREFIX, import_index)
}

/// Import index encoded in `name`
pub fn import_index_from_name(name: &str) -> Option<usize> {
    parse_index(name.strip_prefix(FUNCTION_IMPORT_PREFIX)?)
}

/// Symbol name of the invoke thunk for `function_type`
///
/// e.g. `(i32, f64)->(i64)` becomes `invokeThunk_i32_f64__i64`.
pub fn invoke_thunk_name(function_type: &FunctionType) -> String {
    let mut name = String::from(INVOKE_THUNK_PREFIX);
    for (i, ty) in function_type.params().iter().enumerate() {
        if i > 0 {
            name.push('_');
        }
        name.push_str(ty.name());
    }
    name.push_str("__");
    for (i, ty) in function_type.results().iter().enumerate() {
        if i > 0 {
            name.push('_');
        }
        name.push_str(ty.name());
    }
    name
}

/// Decimal digits exactly as `format!` writes a usize
fn parse_index(digits: &str) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}
