// Integration suites driving the public VM surface with Lua sources.

mod test_bytecode;
mod test_closures;
mod test_compiler;
mod test_control_flow;
mod test_coroutine;
mod test_errors;
mod test_exec_basic;
mod test_gc;
mod test_lexer;
mod test_metamethods;
mod test_strings;
mod test_table;

use crate::lua_value::Value;
use crate::lua_vm::{LuaVM, VmOptions};

/// Run a chunk in a fresh VM with the libraries open; panics on error
/// with the rendered message.
pub fn run(source: &str) -> Vec<Value> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    match vm.execute_string(source) {
        Ok(values) => values,
        Err(e) => panic!("script failed ({:?}): {}", e, vm.error_message()),
    }
}

/// Run a chunk expected to fail; returns the error message.
pub fn run_err(source: &str) -> String {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    match vm.execute_string(source) {
        Ok(_) => panic!("script unexpectedly succeeded"),
        Err(_) => vm.error_message(),
    }
}

pub fn as_int(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        Value::Float(f) => *f as i64,
        other => panic!("expected integer, got {:?}", other),
    }
}

pub fn as_float(v: &Value) -> f64 {
    match v {
        Value::Float(f) => *f,
        Value::Int(i) => *i as f64,
        other => panic!("expected number, got {:?}", other),
    }
}

pub fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        other => panic!("expected boolean, got {:?}", other),
    }
}

/// First result of a chunk as an integer.
pub fn run_int(source: &str) -> i64 {
    let values = run(source);
    as_int(values.first().expect("one result"))
}

pub fn run_bool(source: &str) -> bool {
    let values = run(source);
    as_bool(values.first().expect("one result"))
}

/// First string result of a chunk, rendered.
pub fn run_string(source: &str) -> String {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    let values = match vm.execute_string(source) {
        Ok(values) => values,
        Err(e) => panic!("script failed ({:?}): {}", e, vm.error_message()),
    };
    let v = values.first().expect("one result");
    vm.string_of(v).expect("string result")
}
