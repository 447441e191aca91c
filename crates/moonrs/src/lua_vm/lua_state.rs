// Per-thread execution state: the value stack, the call-info chain, open
// upvalues, coroutine status, and the data that lets protected calls and
// yields survive without live Rust frames (recovery records and the
// pending resume point).

use crate::gc::UpvalId;
use crate::lua_value::Value;
use crate::lua_vm::call_info::CallInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Runnable: fresh (no frames yet) or currently executing.
    Ok,
    /// Suspended in a yield.
    Yielded,
    /// Finished or died with an error.
    Dead,
}

/// Where a yield interrupted a call: resume arguments become the results
/// of the call that sat at `func_idx`.
#[derive(Debug, Clone, Copy)]
pub struct ResumePoint {
    pub func_idx: usize,
    pub nresults: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    Pcall,
    Xpcall,
}

/// A protected frame, as data: everything needed to unwind to the pcall
/// site after its Rust frame is gone (because the body yielded).
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPoint {
    /// Index of the protecting host frame in `call_infos`.
    pub ci_depth: usize,
    /// Stack slot of the protected function (results land here).
    pub func_idx: usize,
    /// Stack slot of the xpcall message handler.
    pub handler_idx: Option<usize>,
    pub kind: RecoveryKind,
    /// The body yielded at least once; completion goes through the
    /// continuation path in the resume driver.
    pub pending: bool,
}

/// Hook event mask bits.
pub mod hook_mask {
    pub const CALL: u8 = 1 << 0;
    pub const RET: u8 = 1 << 1;
    pub const LINE: u8 = 1 << 2;
    pub const COUNT: u8 = 1 << 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    TailCall,
    Return,
    Line(u32),
    Count,
}

pub type HookFn = fn(&mut crate::lua_vm::LuaVM, HookEvent) -> crate::lua_vm::LuaResult<()>;

pub struct LuaThread {
    pub stack: Vec<Value>,
    /// First free stack slot (logical top).
    pub top: usize,
    pub call_infos: Vec<CallInfo>,
    /// Open upvalues pointing into this stack, sorted by ascending slot.
    pub open_upvalues: Vec<UpvalId>,
    pub status: ThreadStatus,
    /// True once the main closure was entered (fresh vs suspended).
    pub started: bool,
    /// Values carried across a yield (out) or an initial resume (in).
    pub yield_values: Vec<Value>,
    pub resume_point: Option<ResumePoint>,
    /// Active protected frames, innermost last.
    pub recovery: Vec<RecoveryPoint>,
    /// Nested host-call depth, to bound runaway recursion.
    pub n_host_calls: u32,
    // Debug hook configuration.
    pub hook: Option<HookFn>,
    pub hook_mask: u8,
    pub hook_count: u32,
    pub hook_counter: u32,
    /// Last line reported to the line hook.
    pub hook_last_line: u32,
    pub in_hook: bool,
}

impl LuaThread {
    pub fn new(initial_stack: usize) -> Self {
        LuaThread {
            stack: vec![Value::Nil; initial_stack],
            top: 0,
            call_infos: Vec::with_capacity(8),
            open_upvalues: Vec::new(),
            status: ThreadStatus::Ok,
            started: false,
            yield_values: Vec::new(),
            resume_point: None,
            recovery: Vec::new(),
            n_host_calls: 0,
            hook: None,
            hook_mask: 0,
            hook_count: 0,
            hook_counter: 0,
            hook_last_line: 0,
            in_hook: false,
        }
    }

    #[inline(always)]
    pub fn get(&self, idx: usize) -> Value {
        self.stack.get(idx).copied().unwrap_or(Value::Nil)
    }

    #[inline(always)]
    pub fn set(&mut self, idx: usize, v: Value) {
        if idx >= self.stack.len() {
            self.stack.resize(idx + 1, Value::Nil);
        }
        self.stack[idx] = v;
    }

    pub fn push(&mut self, v: Value) {
        let top = self.top;
        self.set(top, v);
        self.top += 1;
    }

    pub fn pop(&mut self) -> Value {
        if self.top == 0 {
            return Value::Nil;
        }
        self.top -= 1;
        self.stack[self.top]
    }

    /// Grow the backing vector so slots below `needed` exist.
    pub fn ensure_stack(&mut self, needed: usize) {
        if needed > self.stack.len() {
            let grown = needed.max(self.stack.len() * 2).max(32);
            self.stack.resize(grown, Value::Nil);
        }
    }

    pub fn set_top(&mut self, top: usize) {
        self.ensure_stack(top);
        // Clear dropped slots so stale references do not keep objects
        // alive through the GC's stack scan.
        for i in top..self.top {
            self.stack[i] = Value::Nil;
        }
        self.top = top;
    }

    #[inline(always)]
    pub fn current_ci(&self) -> Option<&CallInfo> {
        self.call_infos.last()
    }

    #[inline(always)]
    pub fn current_ci_mut(&mut self) -> Option<&mut CallInfo> {
        self.call_infos.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.call_infos.len()
    }

    /// Innermost recovery point at or below the current frame depth.
    pub fn innermost_recovery(&self) -> Option<RecoveryPoint> {
        self.recovery.last().copied()
    }
}
