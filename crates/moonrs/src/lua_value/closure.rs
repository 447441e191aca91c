// Function objects and the upvalue cells they capture.

use std::rc::Rc;

use crate::gc::{ThreadId, UpvalId};
use crate::lua_value::proto::Proto;
use crate::lua_value::value::Value;
use crate::lua_vm::{CFunction, LuaVM};

/// Shared cell between an enclosing local and the closures capturing it.
/// Open: the value still lives in a frame's stack slot. Closed: the frame
/// is gone and the cell owns the value.
pub enum Upvalue {
    Open { thread: ThreadId, index: usize },
    Closed(Value),
}

impl Upvalue {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open { .. })
    }
}

pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<UpvalId>,
}

pub struct HostClosure {
    pub func: CFunction,
    pub upvalues: Vec<Value>,
}

pub enum Closure {
    Lua(LuaClosure),
    Host(HostClosure),
}

impl Closure {
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        matches!(self, Closure::Lua(_))
    }

    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match self {
            Closure::Lua(c) => Some(c),
            Closure::Host(_) => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostClosure> {
        match self {
            Closure::Host(c) => Some(c),
            Closure::Lua(_) => None,
        }
    }

    pub fn gc_size(&self) -> usize {
        let upvals = match self {
            Closure::Lua(c) => c.upvalues.len() * 4 + c.proto.gc_size(),
            Closure::Host(c) => c.upvalues.len() * std::mem::size_of::<Value>(),
        };
        std::mem::size_of::<Closure>() + upvals
    }
}

/// Convenience for host-function registration tables.
pub type HostEntry = (&'static str, fn(&mut LuaVM) -> crate::lua_vm::LuaResult<usize>);
