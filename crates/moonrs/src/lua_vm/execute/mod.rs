// The interpreter loop: decode, dispatch, and the per-opcode semantics.
// One invocation runs the current thread's bytecode frames until the
// call-info depth drops to `min_depth` (a frame returned to a host
// caller), a host frame surfaces on top after a resumed protected call,
// or an unwind (error / yield) escapes.

pub mod call;
pub mod metamethod;

pub use call::{
    do_call, do_call_no_yield, do_yield, poscall_host, precall, protected_call, resume,
    run_thread, Called, ResumeOutcome,
};
pub use metamethod::{
    arith, get_metatable_of, get_table, get_tm, length_of, less_equal, less_than, set_table,
    tm_by_value, tostring_value, values_equal,
};

use std::rc::Rc;

use crate::gc::ThreadId;
use crate::lua_value::{Closure, LuaClosure, Proto, Value};
use crate::lua_vm::arith::ArithOp;
use crate::lua_vm::call_info::call_status;
use crate::lua_vm::execute::call::finish_call;
use crate::lua_vm::lua_state::{hook_mask, HookEvent};
use crate::lua_vm::{Instruction, LuaResult, LuaVM, OpCode, LFIELDS_PER_FLUSH};

/// Shared frame context re-read on every call boundary.
struct Frame {
    base: usize,
    proto: Rc<Proto>,
    func_id: crate::gc::FuncId,
}

fn load_frame(vm: &LuaVM, th: ThreadId) -> Frame {
    let ci = vm.pool.thread(th).current_ci().expect("bytecode frame");
    debug_assert!(ci.is_lua());
    let func = vm.pool.thread(th).get(ci.func_idx);
    let func_id = func.as_func_id().expect("frame function");
    let proto = vm
        .pool
        .closure(func_id)
        .as_lua()
        .expect("bytecode closure")
        .proto
        .clone();
    Frame {
        base: ci.base,
        proto,
        func_id,
    }
}

#[inline(always)]
fn reg(vm: &LuaVM, th: ThreadId, base: usize, i: u32) -> Value {
    vm.pool.thread(th).get(base + i as usize)
}

#[inline(always)]
fn set_reg(vm: &mut LuaVM, th: ThreadId, base: usize, i: u32, v: Value) {
    vm.pool.thread_mut(th).set(base + i as usize, v);
}

#[inline(always)]
fn rk(vm: &LuaVM, th: ThreadId, base: usize, proto: &Proto, x: u32) -> Value {
    if Instruction::is_k(x) {
        proto.constants[Instruction::rk_index(x) as usize]
    } else {
        reg(vm, th, base, x)
    }
}

fn opcode_arith(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        OpCode::Div => ArithOp::Div,
        OpCode::IDiv => ArithOp::IDiv,
        OpCode::BAnd => ArithOp::BAnd,
        OpCode::BOr => ArithOp::BOr,
        OpCode::BXor => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        OpCode::Shr => ArithOp::Shr,
        OpCode::Unm => ArithOp::Unm,
        OpCode::BNot => ArithOp::BNot,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

/// Save the frame's program counter (for error positions and resume).
fn save_pc(vm: &mut LuaVM, th: ThreadId, pc: usize) {
    if let Some(ci) = vm.pool.thread_mut(th).current_ci_mut() {
        ci.pc = pc as u32;
    }
}

/// A comparison/test took its branch: apply the following JMP.
fn do_next_jump(vm: &mut LuaVM, th: ThreadId, base: usize, proto: &Proto, pc: &mut usize) {
    let i = proto.code[*pc];
    debug_assert!(Instruction::opcode(i) == OpCode::Jmp);
    let a = Instruction::a(i);
    if a > 0 {
        vm.close_upvalues(th, base + a as usize - 1);
    }
    *pc = (*pc as i64 + 1 + Instruction::sbx(i) as i64) as usize;
}

/// Run line/count hooks for the instruction about to execute.
fn trace_hooks(
    vm: &mut LuaVM,
    th: ThreadId,
    proto: &Proto,
    pc: usize,
) -> LuaResult<()> {
    let (mask, in_hook) = {
        let t = vm.pool.thread(th);
        (t.hook_mask, t.in_hook)
    };
    if mask == 0 || in_hook {
        return Ok(());
    }
    if mask & hook_mask::COUNT != 0 {
        let fire = {
            let t = vm.pool.thread_mut(th);
            if t.hook_counter > 0 {
                t.hook_counter -= 1;
            }
            if t.hook_counter == 0 {
                t.hook_counter = t.hook_count;
                true
            } else {
                false
            }
        };
        if fire {
            vm.call_hook(HookEvent::Count)?;
        }
    }
    if mask & hook_mask::LINE != 0 {
        let line = proto.line_at(pc);
        let fire = {
            let t = vm.pool.thread_mut(th);
            let changed = line != t.hook_last_line;
            t.hook_last_line = line;
            changed
        };
        if fire {
            vm.call_hook(HookEvent::Line(line))?;
        }
    }
    Ok(())
}

/// Execute bytecode frames of `th` until its depth drops to `min_depth`
/// or a non-bytecode frame surfaces.
pub fn vm_execute(vm: &mut LuaVM, th: ThreadId, min_depth: usize) -> LuaResult<()> {
    'reentry: loop {
        {
            let t = vm.pool.thread(th);
            if t.depth() <= min_depth {
                return Ok(());
            }
            let ci = t.current_ci().expect("frame");
            if !ci.is_lua() {
                return Ok(());
            }
        }
        let frame = load_frame(vm, th);
        let base = frame.base;
        let proto = frame.proto;
        let mut pc = vm
            .pool
            .thread(th)
            .current_ci()
            .expect("frame")
            .pc as usize;

        loop {
            if vm.pool.thread(th).hook_mask != 0 {
                save_pc(vm, th, pc);
                trace_hooks(vm, th, &proto, pc)?;
            }
            let i = proto.code[pc];
            pc += 1;
            let op = Instruction::opcode(i);
            let a = Instruction::a(i);
            match op {
                OpCode::Move => {
                    let v = reg(vm, th, base, Instruction::b(i));
                    set_reg(vm, th, base, a, v);
                }
                OpCode::LoadK => {
                    let v = proto.constants[Instruction::bx(i) as usize];
                    set_reg(vm, th, base, a, v);
                }
                OpCode::LoadKx => {
                    let ext = proto.code[pc];
                    debug_assert!(Instruction::opcode(ext) == OpCode::ExtraArg);
                    pc += 1;
                    let v = proto.constants[Instruction::ax(ext) as usize];
                    set_reg(vm, th, base, a, v);
                }
                OpCode::LoadBool => {
                    set_reg(vm, th, base, a, Value::Bool(Instruction::b(i) != 0));
                    if Instruction::c(i) != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let b = Instruction::b(i);
                    for j in 0..=b {
                        set_reg(vm, th, base, a + j, Value::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let uv = upvalue_id(vm, frame.func_id, Instruction::b(i));
                    let v = vm.read_upvalue(uv);
                    set_reg(vm, th, base, a, v);
                }
                OpCode::SetUpval => {
                    let uv = upvalue_id(vm, frame.func_id, Instruction::b(i));
                    let v = reg(vm, th, base, a);
                    vm.write_upvalue(uv, v);
                }
                OpCode::GetTabUp => {
                    save_pc(vm, th, pc);
                    let uv = upvalue_id(vm, frame.func_id, Instruction::b(i));
                    let t = vm.read_upvalue(uv);
                    let k = rk(vm, th, base, &proto, Instruction::c(i));
                    let v = get_table(vm, &t, &k)?;
                    set_reg(vm, th, base, a, v);
                }
                OpCode::GetTable => {
                    save_pc(vm, th, pc);
                    let t = reg(vm, th, base, Instruction::b(i));
                    let k = rk(vm, th, base, &proto, Instruction::c(i));
                    let v = get_table(vm, &t, &k)?;
                    set_reg(vm, th, base, a, v);
                }
                OpCode::SetTabUp => {
                    save_pc(vm, th, pc);
                    let uv = upvalue_id(vm, frame.func_id, a);
                    let t = vm.read_upvalue(uv);
                    let k = rk(vm, th, base, &proto, Instruction::b(i));
                    let v = rk(vm, th, base, &proto, Instruction::c(i));
                    set_table(vm, &t, &k, &v)?;
                }
                OpCode::SetTable => {
                    save_pc(vm, th, pc);
                    let t = reg(vm, th, base, a);
                    let k = rk(vm, th, base, &proto, Instruction::b(i));
                    let v = rk(vm, th, base, &proto, Instruction::c(i));
                    set_table(vm, &t, &k, &v)?;
                }
                OpCode::NewTable => {
                    let asize = Instruction::fb_to_int(Instruction::b(i)) as usize;
                    let hsize = Instruction::fb_to_int(Instruction::c(i)) as usize;
                    let tid = vm.pool.new_table(&mut vm.gc, asize, hsize);
                    set_reg(vm, th, base, a, Value::Table(tid));
                    save_pc(vm, th, pc);
                    vm.maybe_gc_step();
                }
                OpCode::Self_ => {
                    save_pc(vm, th, pc);
                    let t = reg(vm, th, base, Instruction::b(i));
                    set_reg(vm, th, base, a + 1, t);
                    let k = rk(vm, th, base, &proto, Instruction::c(i));
                    let v = get_table(vm, &t, &k)?;
                    set_reg(vm, th, base, a, v);
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::BAnd
                | OpCode::BOr
                | OpCode::BXor
                | OpCode::Shl
                | OpCode::Shr => {
                    save_pc(vm, th, pc);
                    let b = rk(vm, th, base, &proto, Instruction::b(i));
                    let c = rk(vm, th, base, &proto, Instruction::c(i));
                    let v = arith(vm, opcode_arith(op), b, c)?;
                    set_reg(vm, th, base, a, v);
                }
                OpCode::Unm | OpCode::BNot => {
                    save_pc(vm, th, pc);
                    let b = reg(vm, th, base, Instruction::b(i));
                    let v = arith(vm, opcode_arith(op), b, b)?;
                    set_reg(vm, th, base, a, v);
                }
                OpCode::Not => {
                    let b = reg(vm, th, base, Instruction::b(i));
                    set_reg(vm, th, base, a, Value::Bool(b.is_falsy()));
                }
                OpCode::Len => {
                    save_pc(vm, th, pc);
                    let b = reg(vm, th, base, Instruction::b(i));
                    let v = length_of(vm, b)?;
                    set_reg(vm, th, base, a, v);
                }
                OpCode::Concat => {
                    save_pc(vm, th, pc);
                    let b = Instruction::b(i);
                    let c = Instruction::c(i);
                    let n = (c - b + 1) as usize;
                    metamethod::concat_range(vm, th, base + b as usize, n)?;
                    let v = reg(vm, th, base, b);
                    set_reg(vm, th, base, a, v);
                    // Concat may have shuffled slots above the result.
                    let top = vm
                        .pool
                        .thread(th)
                        .current_ci()
                        .expect("frame")
                        .top;
                    vm.pool.thread_mut(th).set_top(top);
                }
                OpCode::Jmp => {
                    if a > 0 {
                        vm.close_upvalues(th, base + a as usize - 1);
                    }
                    pc = (pc as i64 + Instruction::sbx(i) as i64) as usize;
                }
                OpCode::Eq => {
                    save_pc(vm, th, pc);
                    let b = rk(vm, th, base, &proto, Instruction::b(i));
                    let c = rk(vm, th, base, &proto, Instruction::c(i));
                    let res = values_equal(vm, b, c)?;
                    if res == (a != 0) {
                        do_next_jump(vm, th, base, &proto, &mut pc);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Lt => {
                    save_pc(vm, th, pc);
                    let b = rk(vm, th, base, &proto, Instruction::b(i));
                    let c = rk(vm, th, base, &proto, Instruction::c(i));
                    let res = less_than(vm, b, c)?;
                    if res == (a != 0) {
                        do_next_jump(vm, th, base, &proto, &mut pc);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Le => {
                    save_pc(vm, th, pc);
                    let b = rk(vm, th, base, &proto, Instruction::b(i));
                    let c = rk(vm, th, base, &proto, Instruction::c(i));
                    let res = less_equal(vm, b, c)?;
                    if res == (a != 0) {
                        do_next_jump(vm, th, base, &proto, &mut pc);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Test => {
                    let v = reg(vm, th, base, a);
                    if v.is_truthy() == (Instruction::c(i) != 0) {
                        do_next_jump(vm, th, base, &proto, &mut pc);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let v = reg(vm, th, base, Instruction::b(i));
                    if v.is_truthy() == (Instruction::c(i) != 0) {
                        set_reg(vm, th, base, a, v);
                        do_next_jump(vm, th, base, &proto, &mut pc);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Call => {
                    let b = Instruction::b(i);
                    let c = Instruction::c(i);
                    let func_idx = base + a as usize;
                    if b != 0 {
                        vm.pool.thread_mut(th).set_top(func_idx + b as usize);
                    } // else: arguments reach the current top (open call).
                    save_pc(vm, th, pc);
                    let nresults = c as i32 - 1;
                    call_hook_event(vm, th, HookEvent::Call)?;
                    match precall(vm, th, func_idx, nresults)? {
                        Called::Lua => continue 'reentry,
                        Called::HostDone => {
                            call_hook_event(vm, th, HookEvent::Return)?;
                        }
                    }
                }
                OpCode::TailCall => {
                    let b = Instruction::b(i);
                    let func_pos = base + a as usize;
                    if b != 0 {
                        vm.pool.thread_mut(th).set_top(func_pos + b as usize);
                    }
                    save_pc(vm, th, pc);
                    vm.close_upvalues(th, base);
                    // Slide the callee and arguments onto the caller's
                    // frame and replace it.
                    let (dst, nresults) = {
                        let t = vm.pool.thread_mut(th);
                        let ci = t.call_infos.pop().expect("tailcall frame");
                        (ci.func_idx, ci.nresults)
                    };
                    let t = vm.pool.thread_mut(th);
                    let n = t.top - func_pos;
                    for j in 0..n {
                        let v = t.get(func_pos + j);
                        t.set(dst + j, v);
                    }
                    t.set_top(dst + n);
                    call_hook_event(vm, th, HookEvent::TailCall)?;
                    match precall(vm, th, dst, nresults)? {
                        Called::Lua => {
                            if let Some(ci) = vm.pool.thread_mut(th).current_ci_mut() {
                                ci.set_status(call_status::CIST_TAIL);
                            }
                            continue 'reentry;
                        }
                        Called::HostDone => {
                            // The frame is already gone; fall through to
                            // the caller's caller.
                            continue 'reentry;
                        }
                    }
                }
                OpCode::Return => {
                    let b = Instruction::b(i);
                    save_pc(vm, th, pc);
                    vm.close_upvalues(th, base);
                    call_hook_event(vm, th, HookEvent::Return)?;
                    let first = base + a as usize;
                    let nret = if b == 0 {
                        vm.pool.thread(th).top - first
                    } else {
                        (b - 1) as usize
                    };
                    let t = vm.pool.thread_mut(th);
                    finish_call(t, first, nret);
                    continue 'reentry;
                }
                OpCode::ForLoop => {
                    let idx = reg(vm, th, base, a);
                    let limit = reg(vm, th, base, a + 1);
                    let step = reg(vm, th, base, a + 2);
                    match (idx, limit, step) {
                        (Value::Int(x), Value::Int(lim), Value::Int(s)) => {
                            if let Some(next) = x.checked_add(s) {
                                let cont = if s > 0 { next <= lim } else { next >= lim };
                                if cont {
                                    pc = (pc as i64 + Instruction::sbx(i) as i64) as usize;
                                    set_reg(vm, th, base, a, Value::Int(next));
                                    set_reg(vm, th, base, a + 3, Value::Int(next));
                                }
                            }
                        }
                        _ => {
                            let x = idx.as_number().expect("for index");
                            let lim = limit.as_number().expect("for limit");
                            let s = step.as_number().expect("for step");
                            let next = x + s;
                            let cont = if s > 0.0 { next <= lim } else { next >= lim };
                            if cont {
                                pc = (pc as i64 + Instruction::sbx(i) as i64) as usize;
                                set_reg(vm, th, base, a, Value::Float(next));
                                set_reg(vm, th, base, a + 3, Value::Float(next));
                            }
                        }
                    }
                }
                OpCode::ForPrep => {
                    save_pc(vm, th, pc);
                    let init = for_number(vm, th, base, a, "initial")?;
                    let limit = for_number(vm, th, base, a + 1, "limit")?;
                    let step = for_number(vm, th, base, a + 2, "step")?;
                    let step_zero = match step {
                        Value::Int(0) => true,
                        Value::Float(f) => f == 0.0,
                        _ => false,
                    };
                    if step_zero {
                        return Err(vm.runtime_error("'for' step is zero"));
                    }
                    match (init, limit, step) {
                        (Value::Int(x), Value::Int(_), Value::Int(s)) => {
                            set_reg(vm, th, base, a, Value::Int(x.wrapping_sub(s)));
                            set_reg(vm, th, base, a + 1, limit);
                            set_reg(vm, th, base, a + 2, step);
                        }
                        _ => {
                            let x = init.as_number().expect("number");
                            let lim = limit.as_number().expect("number");
                            let s = step.as_number().expect("number");
                            set_reg(vm, th, base, a, Value::Float(x - s));
                            set_reg(vm, th, base, a + 1, Value::Float(lim));
                            set_reg(vm, th, base, a + 2, Value::Float(s));
                        }
                    }
                    pc = (pc as i64 + Instruction::sbx(i) as i64) as usize;
                }
                OpCode::TForCall => {
                    save_pc(vm, th, pc);
                    let c = Instruction::c(i);
                    let func = reg(vm, th, base, a);
                    let state = reg(vm, th, base, a + 1);
                    let control = reg(vm, th, base, a + 2);
                    let call_base = base + a as usize + 3;
                    {
                        let t = vm.pool.thread_mut(th);
                        t.set(call_base, func);
                        t.set(call_base + 1, state);
                        t.set(call_base + 2, control);
                        t.set_top(call_base + 3);
                    }
                    do_call_no_yield(vm, call_base, c as i32)?;
                    // Restore the frame top after the iterator returns.
                    let top = vm.pool.thread(th).current_ci().expect("frame").top;
                    vm.pool.thread_mut(th).set_top(top);
                }
                OpCode::TForLoop => {
                    let ctrl = reg(vm, th, base, a + 1);
                    if !ctrl.is_nil() {
                        set_reg(vm, th, base, a, ctrl);
                        pc = (pc as i64 + Instruction::sbx(i) as i64) as usize;
                    }
                }
                OpCode::SetList => {
                    let b = Instruction::b(i);
                    let mut c = Instruction::c(i);
                    if c == 0 {
                        let ext = proto.code[pc];
                        debug_assert!(Instruction::opcode(ext) == OpCode::ExtraArg);
                        pc += 1;
                        c = Instruction::ax(ext);
                    }
                    let n = if b == 0 {
                        vm.pool.thread(th).top - (base + a as usize) - 1
                    } else {
                        b as usize
                    };
                    let tid = reg(vm, th, base, a)
                        .as_table_id()
                        .expect("SETLIST target");
                    let start = ((c - 1) * LFIELDS_PER_FLUSH) as i64;
                    for j in 1..=n {
                        let v = reg(vm, th, base, a + j as u32);
                        vm.pool.table_set_int(tid, start + j as i64, v);
                    }
                    vm.gc.barrier_back(tid, &mut vm.pool);
                    if b == 0 {
                        let top = vm.pool.thread(th).current_ci().expect("frame").top;
                        vm.pool.thread_mut(th).set_top(top);
                    }
                }
                OpCode::Close => {
                    vm.close_upvalues(th, base + a as usize);
                }
                OpCode::Closure => {
                    save_pc(vm, th, pc);
                    let nested = proto.protos[Instruction::bx(i) as usize].clone();
                    let fid = build_closure(vm, th, base, frame.func_id, nested)?;
                    set_reg(vm, th, base, a, Value::Func(fid));
                    vm.maybe_gc_step();
                }
                OpCode::Vararg => {
                    let b = Instruction::b(i);
                    let ci_func = vm
                        .pool
                        .thread(th)
                        .current_ci()
                        .expect("frame")
                        .func_idx;
                    let navail = base - ci_func - 1 - proto.numparams as usize;
                    let wanted = if b == 0 { navail } else { (b - 1) as usize };
                    let t = vm.pool.thread_mut(th);
                    for j in 0..wanted {
                        let v = if j < navail {
                            t.get(base - navail + j)
                        } else {
                            Value::Nil
                        };
                        t.set(base + a as usize + j, v);
                    }
                    if b == 0 {
                        t.set_top(base + a as usize + wanted);
                    }
                }
                OpCode::ExtraArg => {
                    unreachable!("EXTRAARG is consumed by its predecessor");
                }
            }
        }
    }
}

/// Upvalue id `idx` of the running closure.
fn upvalue_id(vm: &LuaVM, func_id: crate::gc::FuncId, idx: u32) -> crate::gc::UpvalId {
    vm.pool
        .closure(func_id)
        .as_lua()
        .expect("bytecode closure")
        .upvalues[idx as usize]
}

fn for_number(
    vm: &mut LuaVM,
    th: ThreadId,
    base: usize,
    r: u32,
    what: &str,
) -> LuaResult<Value> {
    let v = reg(vm, th, base, r);
    match v {
        Value::Int(_) | Value::Float(_) => Ok(v),
        _ => {
            let msg = format!("'for' {} must be a number", what);
            Err(vm.runtime_error(&msg))
        }
    }
}

/// Instantiate a closure for a nested prototype, sharing open upvalues
/// for locals captured from this frame.
fn build_closure(
    vm: &mut LuaVM,
    th: ThreadId,
    base: usize,
    parent_id: crate::gc::FuncId,
    proto: Rc<Proto>,
) -> LuaResult<crate::gc::FuncId> {
    let mut upvals = Vec::with_capacity(proto.upvalues.len());
    for desc in &proto.upvalues {
        let uv = if desc.in_stack {
            vm.find_or_create_upvalue(th, base + desc.idx as usize)
        } else {
            vm.pool
                .closure(parent_id)
                .as_lua()
                .expect("bytecode closure")
                .upvalues[desc.idx as usize]
        };
        upvals.push(uv);
    }
    let closure = Closure::Lua(LuaClosure {
        proto,
        upvalues: upvals,
    });
    let fid = vm.pool.new_closure(&mut vm.gc, closure);
    Ok(fid)
}

/// Fire a call/return hook when enabled.
fn call_hook_event(vm: &mut LuaVM, th: ThreadId, ev: HookEvent) -> LuaResult<()> {
    let enabled = {
        let t = vm.pool.thread(th);
        !t.in_hook
            && match ev {
                HookEvent::Call | HookEvent::TailCall => t.hook_mask & hook_mask::CALL != 0,
                HookEvent::Return => t.hook_mask & hook_mask::RET != 0,
                _ => false,
            }
    };
    if enabled {
        vm.call_hook(ev)?;
    }
    Ok(())
}
