// Call and return transitions, the per-thread dispatch driver, protected
// calls, and coroutine resume/yield.
//
// Lua-to-Lua calls never consume Rust stack: the flat loop in mod.rs
// pushes and pops CallInfo records. Rust recursion happens only at host
// functions, metamethod invocation, and the host side of resume. Yields
// unwind as Err(LuaError::Yield); everything needed to continue lives in
// the thread (saved pcs, the resume point, recovery records), so a
// resumed coroutine re-enters the flat loop with no live Rust frames.

use crate::gc::ThreadId;
use crate::lua_value::Value;
use crate::lua_vm::call_info::{call_status, CallInfo, MULTRET};
use crate::lua_vm::execute::metamethod::tm_by_value;
use crate::lua_vm::execute::vm_execute;
use crate::lua_vm::lua_state::{RecoveryKind, RecoveryPoint, ResumePoint, ThreadStatus};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, TagMethod};

/// Depth of the __call metamethod chain tolerated on one call.
const MAX_CALL_CHAIN: usize = 16;

pub enum Called {
    /// A bytecode frame was pushed; the dispatch loop continues there.
    Lua,
    /// A host function ran to completion; results are in place.
    HostDone,
}

/// Move fixed parameters of a vararg function above the arguments, so
/// extras stay reachable below the new base.
fn adjust_varargs(vm: &mut LuaVM, th: ThreadId, func_idx: usize, nfix: usize) -> usize {
    let t = vm.pool.thread_mut(th);
    let base = t.top;
    for i in 0..nfix {
        let v = t.get(func_idx + 1 + i);
        t.push(v);
        t.set(func_idx + 1 + i, Value::Nil);
    }
    base
}

/// Prepare a call to the value at `func_idx` with the arguments between
/// it and the thread's top. Resolves the __call chain, splits scripted
/// from host callees, and for host callees runs them to completion.
pub fn precall(
    vm: &mut LuaVM,
    th: ThreadId,
    mut func_idx: usize,
    nresults: i32,
) -> LuaResult<Called> {
    let mut func = vm.pool.thread(th).get(func_idx);
    let mut chain = 0;
    while func.as_func_id().is_none() {
        // Not a function: try its __call, inserting it before the
        // arguments.
        chain += 1;
        if chain > MAX_CALL_CHAIN {
            return Err(vm.runtime_error("'__call' chain too long"));
        }
        let tm = tm_by_value(vm, &func, TagMethod::Call);
        if tm.is_nil() {
            let msg = format!("attempt to call a {} value", func.type_name());
            return Err(vm.runtime_error(&msg));
        }
        let t = vm.pool.thread_mut(th);
        let top = t.top;
        t.ensure_stack(top + 1);
        let mut i = top;
        while i > func_idx {
            let v = t.get(i - 1);
            t.set(i, v);
            i -= 1;
        }
        t.set(func_idx, tm);
        t.top = top + 1;
        func = tm;
    }
    let func_id = func.as_func_id().expect("callable");

    if vm.pool.thread(th).depth() >= vm.options.max_call_depth {
        return Err(vm.stack_overflow_error());
    }

    let is_lua = vm.pool.closure(func_id).is_lua();
    if is_lua {
        let (maxstack, numparams, is_vararg) = {
            let c = vm.pool.closure(func_id).as_lua().expect("lua closure");
            (
                c.proto.maxstacksize as usize,
                c.proto.numparams as usize,
                c.proto.is_vararg,
            )
        };
        // Missing fixed arguments default to nil.
        {
            let t = vm.pool.thread_mut(th);
            while t.top < func_idx + 1 + numparams {
                t.push(Value::Nil);
            }
        }
        let base = if is_vararg {
            adjust_varargs(vm, th, func_idx, numparams)
        } else {
            func_idx + 1
        };
        let t = vm.pool.thread_mut(th);
        t.ensure_stack(base + maxstack);
        let ci = CallInfo::new_lua(func_idx, base, base + maxstack, nresults);
        t.call_infos.push(ci);
        t.set_top(base + maxstack);
        Ok(Called::Lua)
    } else {
        if vm.pool.thread(th).n_host_calls >= vm.options.max_host_depth as u32 {
            return Err(vm.stack_overflow_error());
        }
        let f = vm
            .pool
            .closure(func_id)
            .as_host()
            .expect("host closure")
            .func;
        {
            let t = vm.pool.thread_mut(th);
            let top = t.top;
            let ci = CallInfo::new_host(func_idx, func_idx + 1, top, nresults);
            t.call_infos.push(ci);
            t.n_host_calls += 1;
        }
        let prev_thread = vm.current_thread;
        vm.current_thread = th;
        let result = f(vm);
        vm.current_thread = prev_thread;
        vm.pool.thread_mut(th).n_host_calls -= 1;
        match result {
            Ok(n) => {
                poscall_host(vm, th, n);
                Ok(Called::HostDone)
            }
            Err(LuaError::Yield) => {
                let t = vm.pool.thread_mut(th);
                let ci = t.current_ci().expect("host frame");
                if ci.has_status(call_status::CIST_YPCALL) {
                    // A protected frame whose body yielded: the frame
                    // stays, and resume finishes it through its
                    // continuation.
                } else {
                    // The yield origin: resume arguments become this
                    // call's results.
                    let rp = ResumePoint {
                        func_idx: ci.func_idx,
                        nresults: ci.nresults,
                    };
                    t.call_infos.pop();
                    t.resume_point = Some(rp);
                }
                Err(LuaError::Yield)
            }
            Err(e) => Err(e),
        }
    }
}

/// Move a finished host frame's results into place and pop it.
pub fn poscall_host(vm: &mut LuaVM, th: ThreadId, nres: usize) {
    let t = vm.pool.thread_mut(th);
    let first_result = t.top - nres;
    finish_call(t, first_result, nres);
}

/// Shared return path: move `nres` results from `first_result` down to
/// the frame's function slot, adjust to the expected count, pop the
/// frame, and restore the caller's top when the count is fixed.
pub fn finish_call(t: &mut crate::lua_vm::LuaThread, first_result: usize, nres: usize) {
    let ci = t.call_infos.pop().expect("frame to pop");
    let wanted = ci.nresults;
    let res = ci.func_idx;
    let n = if wanted == MULTRET {
        nres
    } else {
        wanted as usize
    };
    for i in 0..n {
        let v = if i < nres {
            t.get(first_result + i)
        } else {
            Value::Nil
        };
        t.set(res + i, v);
    }
    t.set_top(res + n);
    if wanted != MULTRET {
        if let Some(caller) = t.current_ci() {
            if caller.is_lua() {
                let top = caller.top;
                t.set_top(top);
            }
        }
    }
}

/// Call a value already on the stack. Yield may pass through (used by
/// protected calls and the resume driver).
pub fn do_call(vm: &mut LuaVM, func_idx: usize, nresults: i32) -> LuaResult<()> {
    let th = vm.current_thread;
    match precall(vm, th, func_idx, nresults)? {
        Called::HostDone => Ok(()),
        Called::Lua => {
            let entry = vm.pool.thread(th).depth() - 1;
            vm_execute(vm, th, entry)
        }
    }
}

/// Call for internal consumers (metamethods, iterators) that cannot
/// suspend: a yield crossing this boundary is an error.
pub fn do_call_no_yield(vm: &mut LuaVM, func_idx: usize, nresults: i32) -> LuaResult<()> {
    match do_call(vm, func_idx, nresults) {
        Err(LuaError::Yield) => {
            Err(vm.runtime_error("attempt to yield across a host-call boundary"))
        }
        other => other,
    }
}

/// Protected call over a function already on the stack at `func_idx`
/// with its arguments above it. Returns (success, number of results at
/// func_idx). A yield in the body escapes as Err(Yield) after flagging
/// the recovery record; completion then happens in the resume driver.
pub fn protected_call(
    vm: &mut LuaVM,
    func_idx: usize,
    handler_idx: Option<usize>,
    kind: RecoveryKind,
) -> LuaResult<(bool, usize)> {
    let th = vm.current_thread;
    let ci_depth = vm.pool.thread(th).depth();
    let saved_host_calls = vm.pool.thread(th).n_host_calls;
    vm.pool.thread_mut(th).recovery.push(RecoveryPoint {
        ci_depth,
        func_idx,
        handler_idx,
        kind,
        pending: false,
    });
    match do_call(vm, func_idx, MULTRET) {
        Ok(()) => {
            let rp = vm.pool.thread_mut(th).recovery.pop();
            debug_assert!(rp.is_some());
            let n = vm.pool.thread(th).top - func_idx;
            Ok((true, n))
        }
        Err(LuaError::Yield) => {
            // Keep the record; it survives the unwind and lets a later
            // error (or return) inside the resumed body still resolve
            // this pcall.
            let t = vm.pool.thread_mut(th);
            if let Some(rp) = t.recovery.last_mut() {
                rp.pending = true;
            }
            if let Some(ci) = t.call_infos.get_mut(ci_depth.wrapping_sub(1)) {
                ci.set_status(call_status::CIST_YPCALL);
            }
            Err(LuaError::Yield)
        }
        Err(e) => {
            vm.pool.thread_mut(th).recovery.pop();
            let errv = error_object(vm, e)?;
            let errv = apply_handler(vm, th, handler_idx, errv, e)?;
            unwind_to(vm, th, ci_depth, func_idx, saved_host_calls);
            let t = vm.pool.thread_mut(th);
            t.set(func_idx, errv);
            t.set_top(func_idx + 1);
            Ok((false, 1))
        }
    }
}

/// The error object for an unwinding error kind.
pub fn error_object(vm: &mut LuaVM, e: LuaError) -> LuaResult<Value> {
    Ok(match e {
        LuaError::RuntimeError | LuaError::SyntaxError | LuaError::GcMetamethodError => {
            vm.take_error_value()
        }
        LuaError::OutOfMemory => vm.new_str_value("not enough memory"),
        LuaError::StackOverflow => {
            let v = vm.take_error_value();
            if v.is_nil() {
                vm.new_str_value("stack overflow")
            } else {
                v
            }
        }
        LuaError::ErrorInErrorHandler => vm.new_str_value("error in error handling"),
        LuaError::Yield => unreachable!("yield is not an error object"),
    })
}

/// Run the xpcall message handler in the pre-unwind state so stack
/// context is still observable.
fn apply_handler(
    vm: &mut LuaVM,
    th: ThreadId,
    handler_idx: Option<usize>,
    errv: Value,
    original: LuaError,
) -> LuaResult<Value> {
    let Some(h_idx) = handler_idx else {
        return Ok(errv);
    };
    if original == LuaError::ErrorInErrorHandler {
        // Do not re-enter a failing handler.
        return Ok(errv);
    }
    let handler = vm.pool.thread(th).get(h_idx);
    let t = vm.pool.thread_mut(th);
    let call_at = t.top;
    t.push(handler);
    t.push(errv);
    match do_call_no_yield(vm, call_at, 1) {
        Ok(()) => {
            let v = vm.pool.thread(th).get(call_at);
            let t = vm.pool.thread_mut(th);
            t.set_top(call_at);
            Ok(v)
        }
        Err(_) => Err(LuaError::ErrorInErrorHandler),
    }
}

/// Unwind the thread to a protected frame: close upvalues above the
/// protected slot, drop inner frames, restore host-call depth.
fn unwind_to(
    vm: &mut LuaVM,
    th: ThreadId,
    ci_depth: usize,
    func_idx: usize,
    saved_host_calls: u32,
) {
    vm.close_upvalues(th, func_idx);
    let t = vm.pool.thread_mut(th);
    t.call_infos.truncate(ci_depth);
    t.n_host_calls = saved_host_calls;
    // Drop recovery records that belonged to the discarded frames.
    while t
        .recovery
        .last()
        .map(|r| r.ci_depth > ci_depth)
        .unwrap_or(false)
    {
        t.recovery.pop();
    }
}

// ===== Coroutines =====

/// Outcome of one resume.
pub enum ResumeOutcome {
    /// The coroutine returned; values are the results.
    Finished(Vec<Value>),
    /// The coroutine yielded; values are the yielded ones.
    Yielded(Vec<Value>),
    /// The coroutine raised; the value is the error object.
    Failed(Value),
}

pub fn resume(vm: &mut LuaVM, co: ThreadId, args: Vec<Value>) -> LuaResult<ResumeOutcome> {
    if co == vm.current_thread {
        let v = vm.new_str_value("cannot resume non-suspended coroutine");
        return Ok(ResumeOutcome::Failed(v));
    }
    let status = vm.pool.thread(co).status;
    let started = vm.pool.thread(co).started;
    match status {
        ThreadStatus::Dead => {
            let v = vm.new_str_value("cannot resume dead coroutine");
            return Ok(ResumeOutcome::Failed(v));
        }
        ThreadStatus::Ok if started => {
            let v = vm.new_str_value("cannot resume non-suspended coroutine");
            return Ok(ResumeOutcome::Failed(v));
        }
        _ => {}
    }

    let prev = vm.current_thread;
    vm.resume_chain.push(prev);
    vm.current_thread = co;

    let result = if !started {
        // First entry: the main closure sits at the stack bottom.
        let t = vm.pool.thread_mut(co);
        t.started = true;
        t.status = ThreadStatus::Ok;
        for a in &args {
            t.push(*a);
        }
        start_coroutine(vm, co)
    } else {
        // Deliver the resume arguments as the pending yield's results.
        let t = vm.pool.thread_mut(co);
        t.status = ThreadStatus::Ok;
        let rp = t.resume_point.take();
        if let Some(rp) = rp {
            let n = if rp.nresults == MULTRET {
                args.len()
            } else {
                rp.nresults as usize
            };
            for i in 0..n {
                let v = args.get(i).copied().unwrap_or(Value::Nil);
                t.set(rp.func_idx + i, v);
            }
            let new_top = rp.func_idx + n;
            if rp.nresults == MULTRET {
                t.set_top(new_top);
            } else {
                let frame_top = t.current_ci().map(|ci| ci.top).unwrap_or(new_top);
                t.set_top(frame_top.max(new_top));
            }
        } else {
            // Suspended inside a protected host frame with no call in
            // flight: arguments land on the pending continuation.
            for a in &args {
                t.push(*a);
            }
        }
        run_thread(vm, co)
    };

    vm.current_thread = vm.resume_chain.pop().unwrap_or(vm.main_thread);

    match result {
        Ok(()) => {
            let t = vm.pool.thread_mut(co);
            t.status = ThreadStatus::Dead;
            let results: Vec<Value> = (0..t.top).map(|i| t.get(i)).collect();
            t.set_top(0);
            Ok(ResumeOutcome::Finished(results))
        }
        Err(LuaError::Yield) => {
            let t = vm.pool.thread_mut(co);
            t.status = ThreadStatus::Yielded;
            let values = std::mem::take(&mut t.yield_values);
            Ok(ResumeOutcome::Yielded(values))
        }
        Err(e) => {
            let errv = error_object(vm, e)?;
            let t = vm.pool.thread_mut(co);
            t.status = ThreadStatus::Dead;
            Ok(ResumeOutcome::Failed(errv))
        }
    }
}

fn start_coroutine(vm: &mut LuaVM, co: ThreadId) -> LuaResult<()> {
    match precall(vm, co, 0, MULTRET) {
        Ok(Called::HostDone) => Ok(()),
        Ok(Called::Lua) => run_thread(vm, co),
        Err(e) => Err(e),
    }
}

/// Drive a thread until it finishes, yields, or dies. Handles pending
/// protected frames (pcall bodies that yielded earlier) both on normal
/// return and on error.
pub fn run_thread(vm: &mut LuaVM, th: ThreadId) -> LuaResult<()> {
    loop {
        let depth = vm.pool.thread(th).depth();
        if depth == 0 {
            return Ok(());
        }
        let top_is_lua = vm
            .pool
            .thread(th)
            .current_ci()
            .map(|ci| ci.is_lua())
            .unwrap_or(false);
        if top_is_lua {
            match vm_execute(vm, th, 0) {
                Ok(()) => continue,
                Err(LuaError::Yield) => return Err(LuaError::Yield),
                Err(e) => {
                    if !recover_in_thread(vm, th, e)? {
                        return Err(e);
                    }
                }
            }
        } else {
            // A host frame surfaced: it must be a protected frame whose
            // body finished after a yield.
            finish_pending_protected(vm, th)?;
        }
    }
}

/// Unwind an error inside a resumed thread to its innermost protected
/// frame, finishing that frame with (false, error). Returns false when
/// no protected frame exists (the error kills the thread).
fn recover_in_thread(vm: &mut LuaVM, th: ThreadId, e: LuaError) -> LuaResult<bool> {
    let Some(rp) = vm.pool.thread(th).innermost_recovery() else {
        return Ok(false);
    };
    debug_assert!(rp.pending, "sync recovery is handled in protected_call");
    let errv = error_object(vm, e)?;
    let errv = apply_handler(vm, th, rp.handler_idx, errv, e)?;
    vm.pool.thread_mut(th).recovery.pop();
    let saved = vm.pool.thread(th).n_host_calls;
    unwind_to(vm, th, rp.ci_depth, rp.func_idx, saved);
    let t = vm.pool.thread_mut(th);
    t.set(rp.func_idx, Value::Bool(false));
    t.set(rp.func_idx + 1, errv);
    t.set_top(rp.func_idx + 2);
    // Complete the protecting host frame with these two results.
    let n = 2;
    let first = rp.func_idx;
    finish_call(t, first, n);
    Ok(true)
}

/// Finish a protected host frame whose body completed after a yield:
/// insert the status boolean before the body's results and return them
/// to the pcall caller.
fn finish_pending_protected(vm: &mut LuaVM, th: ThreadId) -> LuaResult<()> {
    let rp = {
        let t = vm.pool.thread(th);
        let ci = t.current_ci().expect("host frame");
        if !ci.has_status(call_status::CIST_YPCALL) {
            return Err(vm.runtime_error("cannot resume a host frame"));
        }
        t.innermost_recovery().expect("protected record")
    };
    vm.pool.thread_mut(th).recovery.pop();
    let t = vm.pool.thread_mut(th);
    let nres = t.top - rp.func_idx;
    // Shift results up one slot and insert the status.
    t.ensure_stack(t.top + 1);
    let mut i = t.top;
    while i > rp.func_idx {
        let v = t.get(i - 1);
        t.set(i, v);
        i -= 1;
    }
    t.set(rp.func_idx, Value::Bool(true));
    t.set_top(rp.func_idx + nres + 1);
    finish_call(t, rp.func_idx, nres + 1);
    Ok(())
}

/// Yield from the running coroutine: stash the values, unwind to the
/// resume driver. The caller (a host function) propagates the returned
/// error kind.
pub fn do_yield(vm: &mut LuaVM, values: Vec<Value>) -> LuaError {
    let th = vm.current_thread;
    if th == vm.main_thread {
        return vm.runtime_error("attempt to yield from outside a coroutine");
    }
    vm.pool.thread_mut(th).yield_values = values;
    LuaError::Yield
}
