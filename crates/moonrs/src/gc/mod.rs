// Incremental tri-color mark-and-sweep collector.
//
// Objects live in typed arenas (`ObjectPool`); the collector works on
// `GcRef` handles. Two white colors alternate between cycles: during sweep
// the *other* white marks garbage while the current white is what survivors
// are repainted to. Gray objects sit on the `gray` work list; threads and
// back-barriered tables go to `grayagain` because they mutate between
// steps and must be re-scanned atomically.
//
// Cycle: Pause -> Propagate -> (atomic) -> SweepString -> SweepAll ->
// Finalize -> Pause. Each `step` performs a bounded amount of work driven
// by allocation debt (pause / stepmul / stepsize knobs).

mod gc_header;
mod gc_id;
mod object_pool;
mod string_interner;

pub use gc_header::{other_white, GcHeader, FIXED, WHITE0, WHITE1};
pub use gc_id::{FuncId, GcRef, StrId, TableId, ThreadId, UdId, UpvalId};
pub use object_pool::{Arena, GcBox, ObjectPool};
pub use string_interner::StringInterner;

use crate::lua_value::{Closure, Proto, Upvalue, Value};

const GC_SWEEP_MAX: usize = 100;
const DEFAULT_PAUSE: i32 = 200;
const DEFAULT_STEPMUL: i32 = 200;
const DEFAULT_STEPSIZE_KB: i32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Atomic,
    SweepString,
    SweepAll,
    Finalize,
}

impl GcState {
    pub fn is_sweep_phase(self) -> bool {
        matches!(self, GcState::SweepString | GcState::SweepAll)
    }

    /// While marking, the tri-color invariant must hold: no black object
    /// may reference a white one.
    pub fn keep_invariant(self) -> bool {
        matches!(self, GcState::Pause | GcState::Propagate | GcState::Atomic)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collection_count: usize,
    pub objects_collected: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

/// Cursor of the chunked arena sweep: (arena index, slot index).
#[derive(Debug, Clone, Copy)]
struct SweepCursor {
    arena: usize,
    slot: usize,
}

pub struct GC {
    pub state: GcState,
    pub current_white: u8,
    /// Bytes allocated but not yet paid for with collection work.
    debt: isize,
    total_bytes: isize,
    /// Live-byte estimate from the last completed cycle.
    estimate: isize,
    marked: isize,

    pause: i32,
    stepmul: i32,
    stepsize_kb: i32,
    stopped: bool,

    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    /// Weak tables found during propagation: (table, weak_keys, weak_values).
    weak: Vec<(TableId, bool, bool)>,
    /// Userdata whose metatable carries __gc and that were not finalized.
    finobj: Vec<UdId>,
    /// Unreachable finalizable userdata, resurrected for one cycle.
    tobefnz: Vec<UdId>,
    /// Finalizers ready to run; drained by the VM between steps.
    pub pending_finalizers: Vec<UdId>,

    /// Phase-local cursor over the intern-table buckets. Interning during
    /// the string sweep only resurrects strings the cursor has not yet
    /// passed, matching the reference's phase-specific index.
    sweep_buckets: Vec<u64>,
    sweep_bucket_idx: usize,
    sweep: SweepCursor,

    /// Interned "__mode" and "__gc" keys, installed by the VM once its
    /// constant strings exist.
    tm_mode: Option<StrId>,
    tm_gc: Option<StrId>,

    pub stats: GcStats,
}

impl GC {
    pub fn new() -> Self {
        GC {
            state: GcState::Pause,
            current_white: WHITE0,
            debt: 0,
            total_bytes: 0,
            estimate: 0,
            marked: 0,
            pause: DEFAULT_PAUSE,
            stepmul: DEFAULT_STEPMUL,
            stepsize_kb: DEFAULT_STEPSIZE_KB,
            stopped: false,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(32),
            weak: Vec::new(),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
            pending_finalizers: Vec::new(),
            sweep_buckets: Vec::new(),
            sweep_bucket_idx: 0,
            sweep: SweepCursor { arena: 0, slot: 0 },
            tm_mode: None,
            tm_gc: None,
            stats: GcStats::default(),
        }
    }

    pub fn set_const_keys(&mut self, tm_mode: StrId, tm_gc: StrId) {
        self.tm_mode = Some(tm_mode);
        self.tm_gc = Some(tm_gc);
    }

    // ===== Accounting =====

    #[inline]
    pub fn track_allocation(&mut self, size: usize) {
        self.total_bytes += size as isize;
        self.debt += size as isize;
        self.stats.bytes_allocated += size;
    }

    #[inline]
    pub fn record_free(&mut self, size: usize) {
        self.total_bytes -= (size as isize).min(self.total_bytes);
        self.stats.bytes_freed += size;
    }

    #[inline(always)]
    pub fn should_collect(&self) -> bool {
        !self.stopped && self.debt > 0
    }

    pub fn total_bytes(&self) -> isize {
        self.total_bytes
    }

    pub fn set_pause_param(&mut self, pause: i32) -> i32 {
        std::mem::replace(&mut self.pause, pause)
    }

    pub fn set_stepmul_param(&mut self, stepmul: i32) -> i32 {
        std::mem::replace(&mut self.stepmul, stepmul)
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn restart(&mut self) {
        self.stopped = false;
        self.debt = 0;
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    /// Schedule the next wakeup: positive debt triggers, negative is credit.
    fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    /// Pause until allocation exceeds the estimate by `pause` percent.
    fn set_pause(&mut self) {
        let threshold = self.estimate.saturating_mul(self.pause as isize) / 100;
        self.set_debt(self.total_bytes - threshold);
    }

    // ===== Stepping =====

    /// One increment of collection, like luaC_step. `force` ignores the
    /// stopped flag and the debt gate (collectgarbage "step").
    pub fn step(&mut self, roots: &[Value], pool: &mut ObjectPool, force: bool) {
        if !force && (self.stopped || self.debt <= 0) {
            return;
        }
        let stepsize = (self.stepsize_kb as isize) * 1024;
        let mut work = (self.debt.max(stepsize) * self.stepmul as isize) / 100;
        loop {
            let done = self.single_step(roots, pool);
            work -= done.max(1);
            if self.state == GcState::Pause {
                self.set_pause();
                return;
            }
            // Pause after atomic even with budget left: finalizers may be
            // pending and must run between steps.
            if work <= 0 || !self.pending_finalizers.is_empty() {
                self.set_debt(-stepsize);
                return;
            }
        }
    }

    /// Run a full cycle to completion (collectgarbage "collect").
    pub fn full(&mut self, roots: &[Value], pool: &mut ObjectPool) {
        // Finish any cycle in flight first so sweeping state is consistent.
        while self.state != GcState::Pause {
            self.single_step(roots, pool);
        }
        self.single_step(roots, pool); // Pause -> Propagate (restart)
        while self.state != GcState::Pause {
            self.single_step(roots, pool);
        }
        self.set_pause();
    }

    fn single_step(&mut self, roots: &[Value], pool: &mut ObjectPool) -> isize {
        match self.state {
            GcState::Pause => {
                self.restart_collection(roots, pool);
                self.state = GcState::Propagate;
                1
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.state = GcState::Atomic;
                    1
                } else {
                    self.propagate_one(pool)
                }
            }
            GcState::Atomic => {
                let work = self.atomic(roots, pool);
                self.enter_sweep(pool);
                work
            }
            GcState::SweepString => {
                let done = self.sweep_string_step(pool);
                if done {
                    self.state = GcState::SweepAll;
                    self.sweep = SweepCursor { arena: 0, slot: 0 };
                }
                GC_SWEEP_MAX as isize
            }
            GcState::SweepAll => {
                let done = self.sweep_arena_step(pool);
                if done {
                    self.estimate = self.total_bytes;
                    self.state = GcState::Finalize;
                }
                GC_SWEEP_MAX as isize
            }
            GcState::Finalize => {
                if let Some(id) = self.tobefnz.pop() {
                    self.pending_finalizers.push(id);
                    1
                } else {
                    self.stats.collection_count += 1;
                    self.state = GcState::Pause;
                    1
                }
            }
        }
    }

    fn restart_collection(&mut self, roots: &[Value], pool: &mut ObjectPool) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.marked = 0;
        for v in roots {
            self.mark_value(v, pool);
        }
    }

    // ===== Marking =====

    pub fn mark_value(&mut self, v: &Value, pool: &mut ObjectPool) {
        if let Some(r) = v.as_gc_ref() {
            self.mark_ref(r, pool);
        }
    }

    pub fn mark_ref(&mut self, r: GcRef, pool: &mut ObjectPool) {
        let Some(h) = pool.header_of_mut(r) else {
            return;
        };
        if !h.is_white() {
            return;
        }
        match r {
            // Strings are leaves: blacken directly.
            GcRef::Str(_) => h.make_black(),
            _ => {
                h.make_gray();
                self.gray.push(r);
            }
        }
    }

    fn propagate_one(&mut self, pool: &mut ObjectPool) -> isize {
        let Some(r) = self.gray.pop() else {
            return 0;
        };
        let work = self.traverse(r, pool, false);
        self.marked += work;
        work
    }

    /// Traverse one object's references. `atomic` selects blackening for
    /// the mutable kinds that otherwise stay on `grayagain`.
    fn traverse(&mut self, r: GcRef, pool: &mut ObjectPool, atomic: bool) -> isize {
        match r {
            GcRef::Table(id) => self.traverse_table(id, pool, atomic),
            GcRef::Func(id) => self.traverse_closure(id, pool),
            GcRef::Upval(id) => self.traverse_upvalue(id, pool),
            GcRef::Ud(id) => self.traverse_userdata(id, pool),
            GcRef::Thread(id) => self.traverse_thread(id, pool, atomic),
            GcRef::Str(id) => {
                if let Some(h) = pool.strings.header_mut(id.0) {
                    h.make_black();
                }
                1
            }
        }
    }

    /// Weak mode of a table, read from its metatable's __mode field.
    fn weak_mode(&self, id: TableId, pool: &ObjectPool) -> (bool, bool) {
        let Some(mode_key) = self.tm_mode else {
            return (false, false);
        };
        let Some(t) = pool.tables.get(id.0) else {
            return (false, false);
        };
        let Some(mt) = t.metatable() else {
            return (false, false);
        };
        let mode = pool.table_get_str(mt, mode_key);
        match mode.as_str_id() {
            Some(sid) => {
                let bytes = pool.string(sid).as_bytes();
                (bytes.contains(&b'k'), bytes.contains(&b'v'))
            }
            None => (false, false),
        }
    }

    fn traverse_table(&mut self, id: TableId, pool: &mut ObjectPool, atomic: bool) -> isize {
        let (weak_k, weak_v) = self.weak_mode(id, pool);
        let (entries, metatable) = match pool.tables.get(id.0) {
            Some(t) => (t.gc_entries(), t.metatable()),
            None => return 0,
        };
        if let Some(h) = pool.tables.header_mut(id.0) {
            h.make_black();
        }
        if let Some(mt) = metatable {
            self.mark_ref(GcRef::Table(mt), pool);
        }
        if weak_k || weak_v {
            // Defer the weak side(s) to the atomic clear.
            if !atomic {
                self.weak.push((id, weak_k, weak_v));
            }
            for (k, v) in &entries {
                if !weak_k {
                    self.mark_value(k, pool);
                }
                if !weak_v {
                    self.mark_value(v, pool);
                }
            }
        } else {
            for (k, v) in &entries {
                self.mark_value(k, pool);
                self.mark_value(v, pool);
            }
        }
        1 + entries.len() as isize
    }

    fn mark_proto(&mut self, proto: &Proto, pool: &mut ObjectPool) -> isize {
        let mut work = 1;
        for k in &proto.constants {
            self.mark_value(k, pool);
        }
        if let Some(src) = proto.source {
            self.mark_ref(GcRef::Str(src), pool);
        }
        for uv in &proto.upvalues {
            if let Some(name) = uv.name {
                self.mark_ref(GcRef::Str(name), pool);
            }
        }
        for lv in &proto.locvars {
            self.mark_ref(GcRef::Str(lv.name), pool);
        }
        for nested in &proto.protos {
            let nested: std::rc::Rc<Proto> = nested.clone();
            work += self.mark_proto(&nested, pool);
        }
        work + proto.constants.len() as isize
    }

    fn traverse_closure(&mut self, id: FuncId, pool: &mut ObjectPool) -> isize {
        enum Parts {
            Lua(std::rc::Rc<Proto>, Vec<UpvalId>),
            Host(Vec<Value>),
        }
        let parts = match pool.closures.get(id.0) {
            Some(Closure::Lua(c)) => Parts::Lua(c.proto.clone(), c.upvalues.clone()),
            Some(Closure::Host(c)) => Parts::Host(c.upvalues.clone()),
            None => return 0,
        };
        if let Some(h) = pool.closures.header_mut(id.0) {
            h.make_black();
        }
        match parts {
            Parts::Lua(proto, upvals) => {
                let mut work = self.mark_proto(&proto, pool);
                for uv in upvals {
                    self.mark_ref(GcRef::Upval(uv), pool);
                    work += 1;
                }
                work
            }
            Parts::Host(upvals) => {
                for v in &upvals {
                    self.mark_value(v, pool);
                }
                1 + upvals.len() as isize
            }
        }
    }

    fn traverse_upvalue(&mut self, id: UpvalId, pool: &mut ObjectPool) -> isize {
        let contents = match pool.upvalues.get(id.0) {
            Some(Upvalue::Closed(v)) => Some(*v),
            Some(Upvalue::Open { thread, index }) => pool
                .threads
                .get(thread.0)
                .and_then(|t| t.stack.get(*index).copied()),
            None => return 0,
        };
        if let Some(h) = pool.upvalues.header_mut(id.0) {
            h.make_black();
        }
        if let Some(v) = contents {
            self.mark_value(&v, pool);
        }
        1
    }

    fn traverse_userdata(&mut self, id: UdId, pool: &mut ObjectPool) -> isize {
        let (metatable, uservalue) = match pool.userdata.get(id.0) {
            Some(u) => (u.metatable, u.uservalue),
            None => return 0,
        };
        if let Some(h) = pool.userdata.header_mut(id.0) {
            h.make_black();
        }
        if let Some(mt) = metatable {
            self.mark_ref(GcRef::Table(mt), pool);
        }
        self.mark_value(&uservalue, pool);
        1
    }

    fn traverse_thread(&mut self, id: ThreadId, pool: &mut ObjectPool, atomic: bool) -> isize {
        let (values, upvals) = match pool.threads.get(id.0) {
            Some(t) => {
                let mut values: Vec<Value> = t.stack.iter().take(t.top).copied().collect();
                values.extend(t.yield_values.iter().copied());
                (values, t.open_upvalues.clone())
            }
            None => return 0,
        };
        // Threads mutate between steps: keep them gray and re-scan them in
        // the atomic phase.
        if let Some(h) = pool.threads.header_mut(id.0) {
            if atomic {
                h.make_black();
            } else {
                h.make_gray();
            }
        }
        if !atomic {
            self.grayagain.push(GcRef::Thread(id));
        }
        for v in &values {
            self.mark_value(v, pool);
        }
        for uv in upvals {
            self.mark_ref(GcRef::Upval(uv), pool);
        }
        1 + values.len() as isize
    }

    // ===== Atomic phase =====

    fn atomic(&mut self, roots: &[Value], pool: &mut ObjectPool) -> isize {
        let mut work = 0;
        // Roots may have changed since the cycle started.
        for v in roots {
            self.mark_value(v, pool);
        }
        while let Some(r) = self.gray.pop() {
            work += self.traverse(r, pool, true);
        }
        // Re-scan mutated threads and back-barriered tables.
        let grayagain = std::mem::take(&mut self.grayagain);
        for r in grayagain {
            work += self.traverse(r, pool, true);
            while let Some(g) = self.gray.pop() {
                work += self.traverse(g, pool, true);
            }
        }

        // Separate unreachable finalizable userdata BEFORE clearing weak
        // values, and resurrect them for this cycle: a weak entry whose
        // value is about to be finalized survives one more cycle.
        let mut still_waiting = Vec::new();
        let finobj = std::mem::take(&mut self.finobj);
        for id in finobj {
            let unreachable = pool
                .userdata
                .header(id.0)
                .map(|h| h.is_white())
                .unwrap_or(false);
            if unreachable {
                self.tobefnz.push(id);
                work += self.traverse(GcRef::Ud(id), pool, true);
                while let Some(g) = self.gray.pop() {
                    work += self.traverse(g, pool, true);
                }
            } else {
                still_waiting.push(id);
            }
        }
        self.finobj = still_waiting;

        // Clear weak entries whose weak side is still white. Strings are
        // never removed from weak tables; touching one here keeps it.
        let weak = std::mem::take(&mut self.weak);
        for (tid, weak_k, weak_v) in weak {
            let dead_list = {
                let Some(t) = pool.tables.get(tid.0) else {
                    continue;
                };
                let mut dead = Vec::new();
                for (k, v) in t.gc_entries() {
                    let k_dead = weak_k && self.value_is_collectable_white(&k, pool);
                    let v_dead = weak_v && self.value_is_collectable_white(&v, pool);
                    if k_dead || v_dead {
                        dead.push(k);
                    }
                }
                dead
            };
            for k in dead_list {
                // Value-side deletion keeps chains intact.
                let _ = pool.table_set(tid, k, Value::Nil);
            }
        }

        self.current_white = other_white(self.current_white);
        work.max(1)
    }

    /// White (unreached) at atomic time, for weak-entry clearing. Strings
    /// are resurrected instead of reported dead.
    fn value_is_collectable_white(&mut self, v: &Value, pool: &mut ObjectPool) -> bool {
        let Some(r) = v.as_gc_ref() else {
            return false;
        };
        if let GcRef::Str(id) = r {
            if let Some(h) = pool.strings.header_mut(id.0) {
                if h.is_white() {
                    h.make_black();
                }
            }
            return false;
        }
        pool.header_of(r).map(|h| h.is_white()).unwrap_or(true)
    }

    // ===== Sweeping =====

    fn enter_sweep(&mut self, pool: &mut ObjectPool) {
        self.state = GcState::SweepString;
        self.sweep_buckets = pool.interner.bucket_keys();
        self.sweep_bucket_idx = 0;
    }

    /// Prune intern buckets; the arena slots are freed by the arena sweep
    /// that follows, so the map never points at a freed string.
    fn sweep_string_step(&mut self, pool: &mut ObjectPool) -> bool {
        let mut done_work = 0;
        while done_work < GC_SWEEP_MAX {
            let Some(&hash) = self.sweep_buckets.get(self.sweep_bucket_idx) else {
                return true;
            };
            self.sweep_bucket_idx += 1;
            let strings = &pool.strings;
            let _dead = pool.interner.sweep_bucket(hash, strings, self.current_white);
            done_work += 1;
        }
        false
    }

    fn sweep_arena_step(&mut self, pool: &mut ObjectPool) -> bool {
        let ow = other_white(self.current_white);
        let white = self.current_white;
        let mut budget = GC_SWEEP_MAX;
        while budget > 0 {
            let finished = match self.sweep.arena {
                0 => Self::sweep_slots(&mut pool.strings, &mut self.sweep.slot, ow, white, &mut budget, &mut self.stats, |s| s.gc_size()),
                1 => Self::sweep_slots(&mut pool.tables, &mut self.sweep.slot, ow, white, &mut budget, &mut self.stats, |t| t.gc_size()),
                2 => Self::sweep_slots(&mut pool.closures, &mut self.sweep.slot, ow, white, &mut budget, &mut self.stats, |c| c.gc_size()),
                3 => Self::sweep_slots(&mut pool.upvalues, &mut self.sweep.slot, ow, white, &mut budget, &mut self.stats, |_| std::mem::size_of::<Upvalue>()),
                4 => Self::sweep_slots(&mut pool.userdata, &mut self.sweep.slot, ow, white, &mut budget, &mut self.stats, |u| u.gc_size()),
                5 => Self::sweep_slots(&mut pool.threads, &mut self.sweep.slot, ow, white, &mut budget, &mut self.stats, |_| 2048),
                _ => return true,
            };
            if finished {
                self.sweep.arena += 1;
                self.sweep.slot = 0;
                if self.sweep.arena > 5 {
                    return true;
                }
            }
        }
        false
    }

    fn sweep_slots<T>(
        arena: &mut Arena<T>,
        slot: &mut usize,
        ow: u8,
        white: u8,
        budget: &mut usize,
        stats: &mut GcStats,
        size_of: impl Fn(&T) -> usize,
    ) -> bool {
        while *budget > 0 {
            if *slot >= arena.capacity() {
                return true;
            }
            let id = *slot as u32;
            *slot += 1;
            *budget -= 1;
            let Some(h) = arena.header(id) else {
                continue;
            };
            if h.is_dead(ow) {
                let size = arena.get(id).map(|d| size_of(d)).unwrap_or(0);
                let _ = arena.free(id);
                stats.objects_collected += 1;
                stats.bytes_freed += size;
            } else if let Some(h) = arena.header_mut(id) {
                h.make_white(white);
            }
        }
        false
    }

    // ===== Write barriers =====

    /// Forward barrier: a black holder was given a white value. While the
    /// invariant must hold, mark the value; during sweep, whiten the
    /// holder instead so the barrier does not fire repeatedly.
    pub fn barrier_forward(&mut self, holder: GcRef, v: GcRef, pool: &mut ObjectPool) {
        let holder_black = pool.header_of(holder).map(|h| h.is_black()).unwrap_or(false);
        let v_white = pool.header_of(v).map(|h| h.is_white()).unwrap_or(false);
        if !holder_black || !v_white {
            return;
        }
        if self.state.keep_invariant() {
            self.mark_ref(v, pool);
        } else if self.state.is_sweep_phase() {
            if let Some(h) = pool.header_of_mut(holder) {
                h.make_white(self.current_white);
            }
        }
    }

    /// Back barrier: tables are mutated often, so demote the table to gray
    /// and re-scan it atomically instead of marking every stored value.
    pub fn barrier_back(&mut self, t: TableId, pool: &mut ObjectPool) {
        let is_black = pool
            .tables
            .header(t.0)
            .map(|h| h.is_black())
            .unwrap_or(false);
        if !is_black {
            return;
        }
        if let Some(h) = pool.tables.header_mut(t.0) {
            h.make_gray();
        }
        self.grayagain.push(GcRef::Table(t));
    }

    // ===== Finalizers =====

    /// All userdata still waiting for finalization, for state close.
    pub fn take_all_finalizable(&mut self) -> Vec<UdId> {
        let mut all = std::mem::take(&mut self.finobj);
        all.extend(std::mem::take(&mut self.tobefnz));
        all
    }

    /// Called when a userdata is first given a metatable with __gc.
    pub fn separate_finalizable(&mut self, id: UdId, pool: &ObjectPool) {
        let already = pool
            .userdata
            .header(id.0)
            .map(|h| h.is_finalized())
            .unwrap_or(true);
        if !already && !self.finobj.contains(&id) {
            self.finobj.push(id);
        }
    }

    pub fn has_gc_metamethod(&self, mt: TableId, pool: &ObjectPool) -> bool {
        match self.tm_gc {
            Some(key) => !pool.table_get_str(mt, key).is_nil(),
            None => false,
        }
    }
}

impl Default for GC {
    fn default() -> Self {
        GC::new()
    }
}
