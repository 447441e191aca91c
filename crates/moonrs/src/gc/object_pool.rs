// Typed arenas for every collectable kind. A slot map with a free list:
// ids stay stable for an object's lifetime and are recycled after sweep.
// All allocation goes through the pool so the collector can paint new
// objects with the current white and charge their size as debt.

use crate::gc::gc_header::GcHeader;
use crate::gc::gc_id::{FuncId, GcRef, StrId, TableId, ThreadId, UdId, UpvalId};
use crate::gc::string_interner::StringInterner;
use crate::gc::GC;
use crate::lua_value::{Closure, LuaStr, StrPool, Table, Upvalue, Userdata, Value};
use crate::lua_vm::LuaThread;

pub struct GcBox<T> {
    pub header: GcHeader,
    pub data: T,
}

pub struct Arena<T> {
    slots: Vec<Option<GcBox<T>>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, data: T, white: u8) -> u32 {
        self.live += 1;
        let gc_box = GcBox {
            header: GcHeader::new(white),
            data,
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(gc_box);
                id
            }
            None => {
                self.slots.push(Some(gc_box));
                (self.slots.len() - 1) as u32
            }
        }
    }

    #[inline(always)]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize)?.as_ref().map(|b| &b.data)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize)?.as_mut().map(|b| &mut b.data)
    }

    #[inline(always)]
    pub fn header(&self, id: u32) -> Option<&GcHeader> {
        self.slots.get(id as usize)?.as_ref().map(|b| &b.header)
    }

    #[inline(always)]
    pub fn header_mut(&mut self, id: u32) -> Option<&mut GcHeader> {
        self.slots.get_mut(id as usize)?.as_mut().map(|b| &mut b.header)
    }

    pub fn free(&mut self, id: u32) -> Option<T> {
        let slot = self.slots.get_mut(id as usize)?;
        let taken = slot.take()?;
        self.free.push(id);
        self.live -= 1;
        Some(taken.data)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &GcBox<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i as u32, b)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut GcBox<T>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|b| (i as u32, b)))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena::new()
    }
}

pub struct ObjectPool {
    pub strings: Arena<LuaStr>,
    pub tables: Arena<Table>,
    pub closures: Arena<Closure>,
    pub upvalues: Arena<Upvalue>,
    pub userdata: Arena<Userdata>,
    pub threads: Arena<LuaThread>,
    pub(crate) interner: StringInterner,
    /// Randomized hash seed shared by the intern set and the table hash.
    pub(crate) seed: ahash::RandomState,
    short_string_limit: usize,
}

impl ObjectPool {
    pub fn new(short_string_limit: usize) -> Self {
        ObjectPool {
            strings: Arena::new(),
            tables: Arena::new(),
            closures: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            interner: StringInterner::new(),
            seed: ahash::RandomState::new(),
            short_string_limit,
        }
    }

    #[inline(always)]
    pub fn str_pool(&self) -> StrPool<'_> {
        StrPool {
            arena: &self.strings,
            seed: &self.seed,
        }
    }

    // ===== Strings =====

    /// Create (or find) a string. Short strings are interned: equal bytes
    /// yield the same id. Long strings always allocate.
    pub fn new_string_bytes(&mut self, gc: &mut GC, bytes: &[u8]) -> StrId {
        if bytes.len() <= self.short_string_limit {
            let hash = self.seed.hash_one(bytes);
            if let Some(id) = self.interner.find(hash, bytes, &self.strings, gc.current_white) {
                // Resurrect a condemned-but-unswept string.
                if let Some(h) = self.strings.header_mut(id.0) {
                    if h.is_white() {
                        h.make_black();
                    }
                }
                return id;
            }
            let s = LuaStr::new_short(bytes.into(), hash);
            let size = s.gc_size();
            let id = StrId(self.strings.alloc(s, gc.current_white));
            self.interner.insert(hash, id);
            gc.track_allocation(size);
            id
        } else {
            let s = LuaStr::new_long(bytes.into());
            let size = s.gc_size();
            let id = StrId(self.strings.alloc(s, gc.current_white));
            gc.track_allocation(size);
            id
        }
    }

    pub fn new_string(&mut self, gc: &mut GC, s: &str) -> StrId {
        self.new_string_bytes(gc, s.as_bytes())
    }

    pub fn new_string_value(&mut self, gc: &mut GC, s: &str) -> Value {
        Value::Str(self.new_string(gc, s))
    }

    #[inline(always)]
    pub fn string(&self, id: StrId) -> &LuaStr {
        self.strings.get(id.0).expect("stale string id")
    }

    pub fn string_display(&self, id: StrId) -> String {
        self.string(id).to_display_string()
    }

    // ===== Tables =====

    pub fn new_table(&mut self, gc: &mut GC, asize: usize, hsize: usize) -> TableId {
        let t = Table::new(asize, hsize);
        gc.track_allocation(t.gc_size());
        TableId(self.tables.alloc(t, gc.current_white))
    }

    #[inline(always)]
    pub fn table(&self, id: TableId) -> &Table {
        self.tables.get(id.0).expect("stale table id")
    }

    #[inline(always)]
    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        self.tables.get_mut(id.0).expect("stale table id")
    }

    /// Raw read through the pool (no metamethods).
    pub fn table_get(&self, id: TableId, key: &Value) -> Value {
        let strs = StrPool {
            arena: &self.strings,
            seed: &self.seed,
        };
        self.tables.get(id.0).expect("stale table id").get(key, &strs)
    }

    pub fn table_get_int(&self, id: TableId, i: i64) -> Value {
        let strs = StrPool {
            arena: &self.strings,
            seed: &self.seed,
        };
        self.tables
            .get(id.0)
            .expect("stale table id")
            .get_int(i, &strs)
    }

    pub fn table_get_str(&self, id: TableId, key: StrId) -> Value {
        self.table_get(id, &Value::Str(key))
    }

    /// Raw write through the pool (no metamethods, no barrier; callers on
    /// the VM paths go through `LuaVM::raw_set_with_barrier`).
    pub fn table_set(
        &mut self,
        id: TableId,
        key: Value,
        value: Value,
    ) -> Result<(), crate::lua_value::TableError> {
        let strs = StrPool {
            arena: &self.strings,
            seed: &self.seed,
        };
        self.tables
            .get_mut(id.0)
            .expect("stale table id")
            .set(key, value, &strs)
    }

    pub fn table_set_int(&mut self, id: TableId, i: i64, value: Value) {
        let strs = StrPool {
            arena: &self.strings,
            seed: &self.seed,
        };
        self.tables
            .get_mut(id.0)
            .expect("stale table id")
            .set_int(i, value, &strs)
    }

    pub fn table_len(&self, id: TableId) -> i64 {
        let strs = StrPool {
            arena: &self.strings,
            seed: &self.seed,
        };
        self.tables.get(id.0).expect("stale table id").length(&strs)
    }

    pub fn table_next(
        &self,
        id: TableId,
        key: &Value,
    ) -> Result<Option<(Value, Value)>, crate::lua_value::TableError> {
        let strs = StrPool {
            arena: &self.strings,
            seed: &self.seed,
        };
        self.tables.get(id.0).expect("stale table id").next(key, &strs)
    }

    // ===== Closures / upvalues =====

    pub fn new_closure(&mut self, gc: &mut GC, c: Closure) -> FuncId {
        gc.track_allocation(c.gc_size());
        FuncId(self.closures.alloc(c, gc.current_white))
    }

    #[inline(always)]
    pub fn closure(&self, id: FuncId) -> &Closure {
        self.closures.get(id.0).expect("stale closure id")
    }

    pub fn new_upvalue(&mut self, gc: &mut GC, uv: Upvalue) -> UpvalId {
        gc.track_allocation(std::mem::size_of::<Upvalue>());
        UpvalId(self.upvalues.alloc(uv, gc.current_white))
    }

    #[inline(always)]
    pub fn upvalue(&self, id: UpvalId) -> &Upvalue {
        self.upvalues.get(id.0).expect("stale upvalue id")
    }

    #[inline(always)]
    pub fn upvalue_mut(&mut self, id: UpvalId) -> &mut Upvalue {
        self.upvalues.get_mut(id.0).expect("stale upvalue id")
    }

    // ===== Userdata / threads =====

    pub fn new_userdata(&mut self, gc: &mut GC, ud: Userdata) -> UdId {
        gc.track_allocation(ud.gc_size());
        UdId(self.userdata.alloc(ud, gc.current_white))
    }

    #[inline(always)]
    pub fn userdata_ref(&self, id: UdId) -> &Userdata {
        self.userdata.get(id.0).expect("stale userdata id")
    }

    #[inline(always)]
    pub fn userdata_mut(&mut self, id: UdId) -> &mut Userdata {
        self.userdata.get_mut(id.0).expect("stale userdata id")
    }

    pub fn new_thread(&mut self, gc: &mut GC, th: LuaThread) -> ThreadId {
        gc.track_allocation(2048);
        ThreadId(self.threads.alloc(th, gc.current_white))
    }

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> &LuaThread {
        self.threads.get(id.0).expect("stale thread id")
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut LuaThread {
        self.threads.get_mut(id.0).expect("stale thread id")
    }

    // ===== Headers by generic reference (barriers, marking) =====

    pub fn header_of(&self, r: GcRef) -> Option<&GcHeader> {
        match r {
            GcRef::Str(id) => self.strings.header(id.0),
            GcRef::Table(id) => self.tables.header(id.0),
            GcRef::Func(id) => self.closures.header(id.0),
            GcRef::Upval(id) => self.upvalues.header(id.0),
            GcRef::Ud(id) => self.userdata.header(id.0),
            GcRef::Thread(id) => self.threads.header(id.0),
        }
    }

    pub fn header_of_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        match r {
            GcRef::Str(id) => self.strings.header_mut(id.0),
            GcRef::Table(id) => self.tables.header_mut(id.0),
            GcRef::Func(id) => self.closures.header_mut(id.0),
            GcRef::Upval(id) => self.upvalues.header_mut(id.0),
            GcRef::Ud(id) => self.userdata.header_mut(id.0),
            GcRef::Thread(id) => self.threads.header_mut(id.0),
        }
    }

    /// Is a reference already freed or condemned for the cycle being swept?
    pub fn is_dead(&self, r: GcRef, other_white: u8) -> bool {
        match self.header_of(r) {
            Some(h) => h.is_dead(other_white),
            None => true,
        }
    }
}
