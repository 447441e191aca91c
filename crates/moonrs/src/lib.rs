// moonrs - a Lua 5.3 runtime
// Bytecode compiler, register VM, and incremental GC in one crate.

#[cfg(test)]
mod test;

pub mod compiler;
pub mod gc;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use compiler::{ChunkReader, SliceReader};
pub use gc::{ObjectPool, StrId, TableId, ThreadId};
pub use lua_value::{Proto, Table, Value, ValueKind};
pub use lua_vm::{
    CFunction, Instruction, LoadMode, LuaError, LuaFullError, LuaResult, LuaVM, OpCode,
    VmOptions,
};

/// Compile and run a source string in a fresh interpreter with the
/// standard globals loaded; returns the chunk's results.
pub fn execute(source: &str) -> LuaResult<Vec<Value>> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    vm.execute_string(source)
}
