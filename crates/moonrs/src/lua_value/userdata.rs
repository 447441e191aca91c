// Full userdata: an opaque host-owned payload with an optional metatable
// and one associated Lua value.

use std::any::Any;

use crate::gc::TableId;
use crate::lua_value::value::Value;

pub struct Userdata {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableId>,
    /// The associated "user value".
    pub uservalue: Value,
}

impl Userdata {
    pub fn new(data: Box<dyn Any>) -> Self {
        Userdata {
            data,
            metatable: None,
            uservalue: Value::Nil,
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }

    pub fn gc_size(&self) -> usize {
        std::mem::size_of::<Userdata>() + 64
    }
}
