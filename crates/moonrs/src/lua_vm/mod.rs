// The interpreter state and its host-facing surface. LuaVM owns the
// object pool, the collector, the globals/registry tables, the interned
// constant strings, and the main thread; coroutines are further thread
// objects in the pool. A host function receives `&mut LuaVM` and works
// on the current thread's frame through the stack API below.

pub mod arith;
mod call_info;
mod const_string;
pub mod execute;
mod lua_error;
mod lua_state;
pub mod opcode;

pub use call_info::{call_status, CallInfo, MULTRET};
pub use const_string::{ConstStrings, TagMethod};
pub use lua_error::{LuaError, LuaFullError};
pub use lua_state::{
    hook_mask, HookEvent, HookFn, LuaThread, RecoveryKind, ResumePoint, ThreadStatus,
};
pub use opcode::{Instruction, OpCode, OpMode, LFIELDS_PER_FLUSH};

use std::rc::Rc;

use crate::compiler::{self, ChunkReader, SliceReader};
use crate::gc::{GcRef, ObjectPool, StrId, TableId, ThreadId, UdId, UpvalId, GC};
use crate::lua_value::{
    dump_proto, undump_proto, Closure, HostClosure, LuaClosure, Proto, Upvalue, Userdata, Value,
    ValueKind, BINARY_SIGNATURE,
};
use crate::lua_vm::execute::{
    do_call, get_metatable_of, protected_call, resume, ResumeOutcome,
};

pub type LuaResult<T> = Result<T, LuaError>;

/// Host function: reads its arguments from the current frame, pushes its
/// results, and returns how many it pushed.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<usize>;

/// Chunk format accepted by `load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Text,
    Binary,
    Both,
}

#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Interning threshold: strings at most this long are deduplicated.
    pub short_string_limit: usize,
    /// CallInfo records per thread.
    pub max_call_depth: usize,
    /// Nested host-function calls per thread.
    pub max_host_depth: usize,
    /// Initial value-stack slots for new threads.
    pub initial_stack: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            short_string_limit: 40,
            max_call_depth: 8000,
            max_host_depth: 200,
            initial_stack: 64,
        }
    }
}

pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: GC,
    pub(crate) globals: TableId,
    pub(crate) registry: TableId,
    pub(crate) main_thread: ThreadId,
    pub(crate) current_thread: ThreadId,
    /// Threads that resumed the current one (status "normal").
    pub(crate) resume_chain: Vec<ThreadId>,
    pub(crate) error_value: Value,
    pub(crate) consts: ConstStrings,
    pub(crate) options: VmOptions,
    /// Per-type metatables for values without their own slot.
    type_mt: [Option<TableId>; 10],
    at_panic: Option<CFunction>,
}

impl LuaVM {
    pub fn new(options: VmOptions) -> Box<LuaVM> {
        let mut pool = ObjectPool::new(options.short_string_limit);
        let mut gc = GC::new();
        let consts = ConstStrings::new(&mut pool, &mut gc);
        gc.set_const_keys(
            consts.tm_name(TagMethod::Mode),
            consts.tm_name(TagMethod::Gc),
        );
        let globals = pool.new_table(&mut gc, 0, 16);
        let registry = pool.new_table(&mut gc, 2, 4);
        let main = pool.new_thread(&mut gc, LuaThread::new(options.initial_stack));
        pool.threads
            .header_mut(main.0)
            .expect("main thread")
            .set_fixed();
        let mut vm = Box::new(LuaVM {
            pool,
            gc,
            globals,
            registry,
            main_thread: main,
            current_thread: main,
            resume_chain: Vec::new(),
            error_value: Value::Nil,
            consts,
            options,
            type_mt: [None; 10],
            at_panic: None,
        });
        // Registry slot 1 holds the globals, as the reference does.
        vm.pool
            .table_set_int(vm.registry, 1, Value::Table(vm.globals));
        let g = Value::Table(vm.globals);
        let key = vm.intern("_G");
        let _ = vm.pool.table_set(vm.globals, Value::Str(key), g);
        vm
    }

    // ===== Identity =====

    pub fn globals(&self) -> TableId {
        self.globals
    }

    pub fn registry(&self) -> TableId {
        self.registry
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn current_thread_id(&self) -> ThreadId {
        self.current_thread
    }

    #[inline(always)]
    pub(crate) fn thread(&self, th: ThreadId) -> &LuaThread {
        self.pool.thread(th)
    }

    // ===== Strings =====

    pub fn intern(&mut self, s: &str) -> StrId {
        self.pool.new_string(&mut self.gc, s)
    }

    pub fn intern_bytes(&mut self, b: &[u8]) -> StrId {
        self.pool.new_string_bytes(&mut self.gc, b)
    }

    pub fn new_str_value(&mut self, s: &str) -> Value {
        Value::Str(self.intern(s))
    }

    pub fn string_of(&self, v: &Value) -> Option<String> {
        v.as_str_id().map(|id| self.pool.string_display(id))
    }

    // ===== Errors =====

    pub fn set_error_string(&mut self, msg: &str) {
        self.error_value = self.new_str_value(msg);
    }

    pub fn set_error_value(&mut self, v: Value) {
        self.error_value = v;
    }

    pub fn take_error_value(&mut self) -> Value {
        std::mem::replace(&mut self.error_value, Value::Nil)
    }

    /// Rendered message of the pending error value.
    pub fn error_message(&self) -> String {
        match self.error_value {
            Value::Str(id) => self.pool.string_display(id),
            v => format!("(error object is a {} value)", v.type_name()),
        }
    }

    pub fn into_full_error(&mut self, kind: LuaError) -> LuaFullError {
        LuaFullError {
            kind,
            message: self.error_message(),
        }
    }

    /// Source position of the instruction being executed, for error
    /// prefixes.
    pub fn current_position(&self) -> Option<(String, u32)> {
        let t = self.thread(self.current_thread);
        for ci in t.call_infos.iter().rev() {
            if ci.is_lua() {
                let func = t.get(ci.func_idx);
                let proto = self
                    .pool
                    .closure(func.as_func_id()?)
                    .as_lua()?
                    .proto
                    .clone();
                let line = proto.line_at((ci.pc as usize).saturating_sub(1));
                let src = proto
                    .source
                    .map(|s| self.pool.string_display(s))
                    .unwrap_or_else(|| "?".to_string());
                return Some((src, line));
            }
        }
        None
    }

    /// Raise a runtime error with the source:line prefix of the current
    /// instruction.
    pub fn runtime_error(&mut self, msg: &str) -> LuaError {
        let full = match self.current_position() {
            Some((src, line)) => format!("{}:{}: {}", src, line, msg),
            None => msg.to_string(),
        };
        self.set_error_string(&full);
        LuaError::RuntimeError
    }

    pub(crate) fn stack_overflow_error(&mut self) -> LuaError {
        self.set_error_string("stack overflow");
        LuaError::StackOverflow
    }

    pub fn at_panic(&mut self, f: Option<CFunction>) -> Option<CFunction> {
        std::mem::replace(&mut self.at_panic, f)
    }

    /// An error escaped every protected frame: consult the panic handler
    /// before handing the error to the embedder.
    fn unprotected_error(&mut self, e: LuaError) -> LuaError {
        if let Some(f) = self.at_panic {
            let _ = f(self);
        }
        e
    }

    // ===== GC =====

    pub fn gc_roots(&self) -> Vec<Value> {
        let mut roots = vec![
            Value::Table(self.globals),
            Value::Table(self.registry),
            Value::Thread(self.main_thread),
            Value::Thread(self.current_thread),
            self.error_value,
        ];
        roots.extend(self.resume_chain.iter().map(|t| Value::Thread(*t)));
        for mt in self.type_mt.iter().flatten() {
            roots.push(Value::Table(*mt));
        }
        roots
    }

    /// Advance the collector when allocation debt demands it, then run
    /// any finalizer it queued. Finalizer errors are contained here.
    pub fn maybe_gc_step(&mut self) {
        if !self.gc.should_collect() {
            return;
        }
        let roots = self.gc_roots();
        self.gc.step(&roots, &mut self.pool, false);
        let _ = self.run_pending_finalizers();
    }

    pub fn gc_step(&mut self) {
        let roots = self.gc_roots();
        self.gc.step(&roots, &mut self.pool, true);
        let _ = self.run_pending_finalizers();
    }

    /// Full collection cycle; surfaces finalizer failures.
    pub fn gc_collect(&mut self) -> LuaResult<()> {
        let roots = self.gc_roots();
        self.gc.full(&roots, &mut self.pool);
        self.run_pending_finalizers()
    }

    pub fn gc_count_bytes(&self) -> isize {
        self.gc.total_bytes()
    }

    pub fn gc_stop(&mut self) {
        self.gc.stop();
    }

    pub fn gc_restart(&mut self) {
        self.gc.restart();
    }

    pub fn gc_is_running(&self) -> bool {
        self.gc.is_running()
    }

    pub fn gc_set_pause(&mut self, pause: i32) -> i32 {
        self.gc.set_pause_param(pause)
    }

    pub fn gc_set_step_multiplier(&mut self, mul: i32) -> i32 {
        self.gc.set_stepmul_param(mul)
    }

    fn run_pending_finalizers(&mut self) -> LuaResult<()> {
        let mut first_error = None;
        while let Some(ud) = self.gc.pending_finalizers.pop() {
            let udv = Value::UserData(ud);
            let tm = execute::tm_by_value(self, &udv, TagMethod::Gc);
            if tm.is_nil() {
                continue;
            }
            let th = self.current_thread;
            let t = self.pool.thread_mut(th);
            let call_at = t.top;
            t.push(tm);
            t.push(udv);
            match protected_call(self, call_at, None, RecoveryKind::Pcall) {
                Ok((true, _)) => {
                    let t = self.pool.thread_mut(th);
                    t.set_top(call_at);
                }
                Ok((false, _)) => {
                    let t = self.pool.thread_mut(th);
                    let errv = t.get(call_at);
                    t.set_top(call_at);
                    self.error_value = errv;
                    first_error.get_or_insert(LuaError::GcMetamethodError);
                }
                Err(e) => {
                    let t = self.pool.thread_mut(th);
                    t.set_top(call_at);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(_) => Err(LuaError::GcMetamethodError),
            None => Ok(()),
        }
    }

    // ===== Upvalues =====

    pub(crate) fn read_upvalue(&self, uv: UpvalId) -> Value {
        match self.pool.upvalue(uv) {
            Upvalue::Closed(v) => *v,
            Upvalue::Open { thread, index } => self.pool.thread(*thread).get(*index),
        }
    }

    pub(crate) fn write_upvalue(&mut self, uv: UpvalId, v: Value) {
        match self.pool.upvalue_mut(uv) {
            Upvalue::Closed(slot) => *slot = v,
            Upvalue::Open { thread, index } => {
                let (th, idx) = (*thread, *index);
                self.pool.thread_mut(th).set(idx, v);
            }
        }
        if let Some(r) = v.as_gc_ref() {
            self.gc.barrier_forward(GcRef::Upval(uv), r, &mut self.pool);
        }
    }

    /// Open upvalue over a stack slot, shared among all closures that
    /// capture it. The per-thread list stays sorted by slot so closing
    /// everything above a level is one suffix walk.
    pub(crate) fn find_or_create_upvalue(&mut self, th: ThreadId, index: usize) -> UpvalId {
        let mut insert_at = None;
        {
            let opens = &self.pool.thread(th).open_upvalues;
            for (k, &uv) in opens.iter().enumerate() {
                if let Upvalue::Open { index: i, .. } = self.pool.upvalue(uv) {
                    if *i == index {
                        return uv;
                    }
                    if *i > index && insert_at.is_none() {
                        insert_at = Some(k);
                    }
                }
            }
        }
        let uv = self
            .pool
            .new_upvalue(&mut self.gc, Upvalue::Open { thread: th, index });
        let list = &mut self.pool.thread_mut(th).open_upvalues;
        match insert_at {
            Some(k) => list.insert(k, uv),
            None => list.push(uv),
        }
        uv
    }

    /// Close every open upvalue at or above `level`: the cell takes
    /// ownership of the current stack value.
    pub(crate) fn close_upvalues(&mut self, th: ThreadId, level: usize) {
        let to_close: Vec<UpvalId> = self
            .pool
            .thread(th)
            .open_upvalues
            .iter()
            .copied()
            .filter(|&uv| match self.pool.upvalue(uv) {
                Upvalue::Open { index, .. } => *index >= level,
                Upvalue::Closed(_) => true,
            })
            .collect();
        if to_close.is_empty() {
            return;
        }
        let t = self.pool.thread_mut(th);
        t.open_upvalues.retain(|uv| !to_close.contains(uv));
        for uv in to_close {
            let v = match self.pool.upvalue(uv) {
                Upvalue::Open { thread, index } => self.pool.thread(*thread).get(*index),
                Upvalue::Closed(v) => *v,
            };
            *self.pool.upvalue_mut(uv) = Upvalue::Closed(v);
            if let Some(r) = v.as_gc_ref() {
                self.gc.barrier_forward(GcRef::Upval(uv), r, &mut self.pool);
            }
        }
    }

    // ===== Tables =====

    /// Fresh table. No collection step runs here: the caller holds the
    /// only reference and must anchor it before allocating again.
    pub fn new_table(&mut self, asize: usize, hsize: usize) -> TableId {
        self.pool.new_table(&mut self.gc, asize, hsize)
    }

    pub fn raw_get(&self, t: TableId, key: &Value) -> Value {
        self.pool.table_get(t, key)
    }

    pub fn raw_get_str(&mut self, t: TableId, key: &str) -> Value {
        let k = self.intern(key);
        self.pool.table_get_str(t, k)
    }

    /// Raw write with the key checks and the table write barrier.
    pub(crate) fn raw_set_checked(&mut self, t: TableId, key: Value, v: Value) -> LuaResult<()> {
        match self.pool.table_set(t, key, v) {
            Ok(()) => {
                self.gc.barrier_back(t, &mut self.pool);
                Ok(())
            }
            Err(crate::lua_value::TableError::NilKey) => {
                Err(self.runtime_error("table index is nil"))
            }
            Err(crate::lua_value::TableError::NanKey) => {
                Err(self.runtime_error("table index is NaN"))
            }
            Err(crate::lua_value::TableError::InvalidNextKey) => {
                Err(self.runtime_error("invalid key to 'next'"))
            }
        }
    }

    pub fn raw_set(&mut self, t: TableId, key: Value, v: Value) -> LuaResult<()> {
        self.raw_set_checked(t, key, v)
    }

    pub fn raw_set_str(&mut self, t: TableId, key: &str, v: Value) -> LuaResult<()> {
        let k = self.intern(key);
        self.raw_set_checked(t, Value::Str(k), v)
    }

    pub fn raw_len(&self, t: TableId) -> i64 {
        self.pool.table_len(t)
    }

    /// Metamethod-aware read/write.
    pub fn get_field(&mut self, t: Value, key: &Value) -> LuaResult<Value> {
        execute::get_table(self, &t, key)
    }

    pub fn set_field(&mut self, t: Value, key: Value, v: Value) -> LuaResult<()> {
        execute::set_table(self, &t, &key, &v)
    }

    pub fn set_global(&mut self, name: &str, v: Value) {
        let g = self.globals;
        let _ = self.raw_set_str(g, name, v);
    }

    pub fn get_global(&mut self, name: &str) -> Value {
        let g = self.globals;
        self.raw_get_str(g, name)
    }

    pub fn table_next(&mut self, t: TableId, key: &Value) -> LuaResult<Option<(Value, Value)>> {
        match self.pool.table_next(t, key) {
            Ok(pair) => Ok(pair),
            Err(_) => Err(self.runtime_error("invalid key to 'next'")),
        }
    }

    pub fn get_metatable(&self, v: &Value) -> Option<TableId> {
        get_metatable_of(self, v)
    }

    pub fn type_metatable(&self, kind: ValueKind) -> Option<TableId> {
        self.type_mt[kind as usize]
    }

    pub fn set_type_metatable(&mut self, kind: ValueKind, mt: Option<TableId>) {
        self.type_mt[kind as usize] = mt;
    }

    /// Install a metatable on a table or userdata. Installing one with
    /// __gc on a userdata registers it for finalization.
    pub fn set_metatable(&mut self, v: &Value, mt: Option<TableId>) -> LuaResult<()> {
        match v {
            Value::Table(tid) => {
                self.pool.table_mut(*tid).set_metatable(mt);
                if let Some(m) = mt {
                    self.gc
                        .barrier_forward(GcRef::Table(*tid), GcRef::Table(m), &mut self.pool);
                }
                Ok(())
            }
            Value::UserData(uid) => {
                self.pool.userdata_mut(*uid).metatable = mt;
                if let Some(m) = mt {
                    self.gc
                        .barrier_forward(GcRef::Ud(*uid), GcRef::Table(m), &mut self.pool);
                    if self.gc.has_gc_metamethod(m, &self.pool) {
                        self.gc.separate_finalizable(*uid, &self.pool);
                    }
                }
                Ok(())
            }
            _ => Err(self.runtime_error("cannot change this metatable")),
        }
    }

    // ===== Functions and userdata =====

    pub fn push_host_closure(&mut self, f: CFunction, upvalues: Vec<Value>) -> Value {
        let c = Closure::Host(HostClosure { func: f, upvalues });
        let id = self.pool.new_closure(&mut self.gc, c);
        Value::Func(id)
    }

    pub fn new_lua_closure(&mut self, proto: Rc<Proto>, upvalues: Vec<UpvalId>) -> Value {
        let c = Closure::Lua(LuaClosure { proto, upvalues });
        let id = self.pool.new_closure(&mut self.gc, c);
        Value::Func(id)
    }

    pub fn new_userdata(&mut self, data: Box<dyn std::any::Any>) -> UdId {
        self.pool.new_userdata(&mut self.gc, Userdata::new(data))
    }

    pub fn new_thread(&mut self) -> ThreadId {
        self.pool
            .new_thread(&mut self.gc, LuaThread::new(self.options.initial_stack))
    }

    // ===== Host frame (stack API for CFunctions) =====

    fn frame_base(&self) -> usize {
        let t = self.thread(self.current_thread);
        t.current_ci().map(|ci| ci.base).unwrap_or(0)
    }

    /// Number of arguments of the running host function.
    pub fn arg_count(&self) -> usize {
        let t = self.thread(self.current_thread);
        let base = self.frame_base();
        t.top.saturating_sub(base)
    }

    /// 1-based argument access; missing arguments read as nil.
    pub fn arg(&self, i: usize) -> Value {
        debug_assert!(i >= 1);
        if i > self.arg_count() {
            return Value::Nil;
        }
        let base = self.frame_base();
        self.thread(self.current_thread).get(base + i - 1)
    }

    /// Absolute stack index of argument `i`.
    pub fn arg_index(&self, i: usize) -> usize {
        self.frame_base() + i - 1
    }

    pub fn push(&mut self, v: Value) {
        let th = self.current_thread;
        self.pool.thread_mut(th).push(v);
    }

    pub fn top(&self) -> usize {
        self.thread(self.current_thread).top
    }

    pub fn stack_value(&self, idx: usize) -> Value {
        self.thread(self.current_thread).get(idx)
    }

    pub fn set_top(&mut self, top: usize) {
        let th = self.current_thread;
        self.pool.thread_mut(th).set_top(top);
    }

    /// Upvalue `i` (1-based) of the running host closure.
    pub fn host_upvalue(&self, i: usize) -> Value {
        let t = self.thread(self.current_thread);
        let Some(ci) = t.current_ci() else {
            return Value::Nil;
        };
        let f = t.get(ci.func_idx);
        match f.as_func_id().map(|id| self.pool.closure(id)) {
            Some(Closure::Host(h)) => h.upvalues.get(i - 1).copied().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    pub fn set_host_upvalue(&mut self, i: usize, v: Value) {
        let th = self.current_thread;
        let t = self.thread(th);
        let Some(ci) = t.current_ci() else {
            return;
        };
        let f = t.get(ci.func_idx);
        if let Some(id) = f.as_func_id() {
            if let Some(Closure::Host(h)) = self.pool.closures.get_mut(id.0) {
                if let Some(slot) = h.upvalues.get_mut(i - 1) {
                    *slot = v;
                }
            }
            if let Some(r) = v.as_gc_ref() {
                self.gc.barrier_forward(GcRef::Func(id), r, &mut self.pool);
            }
        }
    }

    // ===== Calls =====

    /// Call a function value with arguments, collecting its results.
    /// Errors unwind to the caller with the error value pending.
    pub fn call_function(&mut self, f: Value, args: &[Value]) -> LuaResult<Vec<Value>> {
        let th = self.current_thread;
        let t = self.pool.thread_mut(th);
        let call_at = t.top;
        t.push(f);
        for a in args {
            t.push(*a);
        }
        match do_call(self, call_at, MULTRET) {
            Ok(()) => {
                let t = self.pool.thread_mut(th);
                let results: Vec<Value> = (call_at..t.top).map(|i| t.get(i)).collect();
                t.set_top(call_at);
                Ok(results)
            }
            Err(LuaError::Yield) => {
                Err(self.runtime_error("attempt to yield across a host-call boundary"))
            }
            Err(e) => Err(self.unprotected_error(e)),
        }
    }

    /// Protected call over a function value: Ok(results) or the caught
    /// error value.
    pub fn pcall_function(&mut self, f: Value, args: &[Value]) -> LuaResult<Result<Vec<Value>, Value>> {
        let th = self.current_thread;
        let t = self.pool.thread_mut(th);
        let call_at = t.top;
        t.push(f);
        for a in args {
            t.push(*a);
        }
        let (ok, n) = protected_call(self, call_at, None, RecoveryKind::Pcall)
            .map_err(|e| self.unprotected_error(e))?;
        let t = self.pool.thread_mut(th);
        let values: Vec<Value> = (call_at..call_at + n).map(|i| t.get(i)).collect();
        t.set_top(call_at);
        Ok(if ok {
            Ok(values)
        } else {
            Err(values.first().copied().unwrap_or(Value::Nil))
        })
    }

    // ===== Coroutines =====

    pub fn resume_thread(&mut self, co: ThreadId, args: Vec<Value>) -> LuaResult<ResumeOutcome> {
        resume(self, co, args)
    }

    pub fn coroutine_status(&self, co: ThreadId) -> &'static str {
        if co == self.current_thread {
            return "running";
        }
        if self.resume_chain.contains(&co) {
            return "normal";
        }
        let t = self.thread(co);
        match t.status {
            ThreadStatus::Dead => "dead",
            ThreadStatus::Yielded => "suspended",
            ThreadStatus::Ok => "suspended",
        }
    }

    // ===== Hooks =====

    pub fn set_hook(&mut self, hook: Option<HookFn>, mask: u8, count: u32) {
        let th = self.current_thread;
        let t = self.pool.thread_mut(th);
        t.hook = hook;
        t.hook_mask = if hook.is_some() { mask } else { 0 };
        t.hook_count = count;
        t.hook_counter = count;
    }

    pub(crate) fn call_hook(&mut self, ev: HookEvent) -> LuaResult<()> {
        let th = self.current_thread;
        let hook = {
            let t = self.pool.thread_mut(th);
            if t.in_hook {
                return Ok(());
            }
            t.in_hook = true;
            t.hook
        };
        let result = match hook {
            Some(f) => f(self, ev),
            None => Ok(()),
        };
        self.pool.thread_mut(th).in_hook = false;
        result
    }

    // ===== Loading and running =====

    /// Compile or undump a chunk into a closure over the globals.
    pub fn load<'r>(
        &mut self,
        reader: Box<dyn ChunkReader + 'r>,
        chunkname: &str,
        mode: LoadMode,
    ) -> LuaResult<Value> {
        let mut lex_probe = compiler::Lexer::new(reader, chunkname);
        let is_binary = lex_probe.peek_byte() == Some(BINARY_SIGNATURE[0]);
        if is_binary {
            if mode == LoadMode::Text {
                self.set_error_string("attempt to load a binary chunk");
                return Err(LuaError::SyntaxError);
            }
            let bytes = lex_probe.take_rest();
            let proto = undump_proto(self, &bytes)?;
            return Ok(self.wrap_main_proto(proto));
        }
        if mode == LoadMode::Binary {
            self.set_error_string("attempt to load a text chunk");
            return Err(LuaError::SyntaxError);
        }
        let proto = compiler::compile_with_lexer(self, lex_probe)?;
        Ok(self.wrap_main_proto(proto))
    }

    pub fn load_str(&mut self, source: &str, chunkname: &str) -> LuaResult<Value> {
        self.load(
            Box::new(SliceReader::new(source.as_bytes())),
            chunkname,
            LoadMode::Both,
        )
    }

    /// Wrap a top-level prototype: upvalue 0 is _ENV, closed over the
    /// globals table; any further upvalues start as nil.
    pub fn wrap_main_proto(&mut self, proto: Proto) -> Value {
        let g = Value::Table(self.globals);
        let n = proto.upvalues.len().max(1);
        let mut upvalues = Vec::with_capacity(n);
        for i in 0..n {
            let init = if i == 0 { g } else { Value::Nil };
            let uv = self.pool.new_upvalue(&mut self.gc, Upvalue::Closed(init));
            upvalues.push(uv);
        }
        self.new_lua_closure(Rc::new(proto), upvalues)
    }

    /// Serialize a bytecode closure.
    pub fn dump(&self, f: Value) -> LuaResult<Vec<u8>> {
        let Some(id) = f.as_func_id() else {
            return Err(LuaError::RuntimeError);
        };
        match self.pool.closure(id) {
            Closure::Lua(c) => Ok(dump_proto(self, &c.proto)),
            Closure::Host(_) => Err(LuaError::RuntimeError),
        }
    }

    /// Compile and run a source string on the main thread, returning the
    /// chunk's results.
    pub fn execute_string(&mut self, source: &str) -> LuaResult<Vec<Value>> {
        let f = self.load_str(source, source_chunkname(source).as_str())?;
        match self.pcall_function(f, &[])? {
            Ok(values) => Ok(values),
            Err(errv) => {
                self.error_value = errv;
                Err(LuaError::RuntimeError)
            }
        }
    }

    /// One-call convenience alias for execute_string.
    pub fn execute(&mut self, source: &str) -> LuaResult<Vec<Value>> {
        self.execute_string(source)
    }

    pub fn open_libs(&mut self) {
        crate::stdlib::open_libs(self);
    }

    /// Frames currently active on the running thread.
    pub fn stack_depth(&self) -> usize {
        self.thread(self.current_thread).depth()
    }

    /// Shut the state down: run every outstanding finalizer, protected.
    /// Dropping the VM afterwards frees all memory through the arenas.
    pub fn close(&mut self) {
        let pending = self.gc.take_all_finalizable();
        self.gc.pending_finalizers.extend(pending);
        let _ = self.run_pending_finalizers();
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        self.close();
    }
}

fn source_chunkname(source: &str) -> String {
    let mut name = String::from("[string \"");
    let first = source.lines().next().unwrap_or("");
    if first.len() > 40 || source.lines().count() > 1 {
        let cut = first
            .char_indices()
            .take_while(|(i, _)| *i < 37)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        name.push_str(&first[..cut]);
        name.push_str("...");
    } else {
        name.push_str(first);
    }
    name.push_str("\"]");
    name
}
