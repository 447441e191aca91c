// Library registration. Only the basic functions and the coroutine
// wrappers live here; the bigger library modules are out of scope for
// the core.

mod basic;
mod coroutine;

use crate::lua_value::Value;
use crate::lua_vm::{CFunction, LuaVM};

pub(crate) fn register_into(vm: &mut LuaVM, table: crate::gc::TableId, entries: &[(&str, CFunction)]) {
    for (name, f) in entries {
        let fv = vm.push_host_closure(*f, Vec::new());
        let key = vm.intern(name);
        let _ = vm.raw_set(table, Value::Str(key), fv);
    }
}

pub fn open_libs(vm: &mut LuaVM) {
    basic::open(vm);
    coroutine::open(vm);
}
