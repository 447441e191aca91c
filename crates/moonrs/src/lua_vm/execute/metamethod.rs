// Metamethod resolution and the slow paths of the VM: table access
// chains, arithmetic fallbacks, ordering, equality, length, and
// concatenation.

use crate::gc::{TableId, ThreadId};
use crate::lua_value::{fmt_float, fmt_int, Value};
use crate::lua_vm::arith::{num_le, num_lt, raw_arith, ArithOp};
use crate::lua_vm::const_string::{TagMethod, TM_FAST_COUNT};
use crate::lua_vm::execute::call::do_call_no_yield;
use crate::lua_vm::{LuaResult, LuaVM};

/// Chain limit for __index / __newindex loops.
const MAX_TAG_LOOP: usize = 2000;

/// Metatable of any value: per-object for tables and userdata, per-type
/// otherwise.
pub fn get_metatable_of(vm: &LuaVM, v: &Value) -> Option<TableId> {
    match v {
        Value::Table(id) => vm.pool.table(*id).metatable(),
        Value::UserData(id) => vm.pool.userdata_ref(*id).metatable,
        _ => vm.type_metatable(v.kind()),
    }
}

/// Raw metamethod fetch from a metatable, maintaining the per-table
/// "known absent" cache for the fast events.
pub fn get_tm(vm: &mut LuaVM, mt: TableId, tm: TagMethod) -> Value {
    let fast = (tm as usize) < TM_FAST_COUNT;
    if fast {
        let flags = vm.pool.table(mt).flags;
        if flags & (1 << tm as u8) != 0 {
            return Value::Nil;
        }
    }
    let key = vm.consts.tm_name(tm);
    let v = vm.pool.table_get_str(mt, key);
    if v.is_nil() && fast {
        vm.pool.table_mut(mt).flags |= 1 << tm as u8;
    }
    v
}

/// Metamethod of a value for an event, or nil.
pub fn tm_by_value(vm: &mut LuaVM, v: &Value, tm: TagMethod) -> Value {
    match get_metatable_of(vm, v) {
        Some(mt) => get_tm(vm, mt, tm),
        None => Value::Nil,
    }
}

/// Call a metamethod with arguments, collecting one result.
pub fn call_tm_res(vm: &mut LuaVM, f: Value, args: &[Value]) -> LuaResult<Value> {
    let th = vm.current_thread;
    let t = vm.pool.thread_mut(th);
    let call_at = t.top;
    t.push(f);
    for a in args {
        t.push(*a);
    }
    do_call_no_yield(vm, call_at, 1)?;
    let v = vm.pool.thread(th).get(call_at);
    let t = vm.pool.thread_mut(th);
    t.set_top(call_at);
    Ok(v)
}

/// Call a metamethod for effect only (e.g. __newindex functions).
pub fn call_tm(vm: &mut LuaVM, f: Value, args: &[Value]) -> LuaResult<()> {
    let th = vm.current_thread;
    let t = vm.pool.thread_mut(th);
    let call_at = t.top;
    t.push(f);
    for a in args {
        t.push(*a);
    }
    do_call_no_yield(vm, call_at, 0)?;
    let t = vm.pool.thread_mut(th);
    t.set_top(call_at);
    Ok(())
}

// ===== Indexing =====

/// `t[k]` with the full __index chain.
pub fn get_table(vm: &mut LuaVM, t: &Value, key: &Value) -> LuaResult<Value> {
    let mut cur = *t;
    for _ in 0..MAX_TAG_LOOP {
        if let Value::Table(tid) = cur {
            let raw = vm.pool.table_get(tid, key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            let tm = match vm.pool.table(tid).metatable() {
                Some(mt) => get_tm(vm, mt, TagMethod::Index),
                None => Value::Nil,
            };
            if tm.is_nil() {
                return Ok(Value::Nil);
            }
            if tm.is_function() {
                return call_tm_res(vm, tm, &[cur, *key]);
            }
            cur = tm;
        } else {
            let tm = tm_by_value(vm, &cur, TagMethod::Index);
            if tm.is_nil() {
                let msg = format!("attempt to index a {} value", cur.type_name());
                return Err(vm.runtime_error(&msg));
            }
            if tm.is_function() {
                return call_tm_res(vm, tm, &[cur, *key]);
            }
            cur = tm;
        }
    }
    Err(vm.runtime_error("'__index' chain too long; possible loop"))
}

/// `t[k] = v` with the full __newindex chain.
pub fn set_table(vm: &mut LuaVM, t: &Value, key: &Value, value: &Value) -> LuaResult<()> {
    let mut cur = *t;
    for _ in 0..MAX_TAG_LOOP {
        if let Value::Table(tid) = cur {
            let raw = vm.pool.table_get(tid, key);
            if !raw.is_nil() {
                // Present key: plain write.
                return vm.raw_set_checked(tid, *key, *value);
            }
            let tm = match vm.pool.table(tid).metatable() {
                Some(mt) => get_tm(vm, mt, TagMethod::NewIndex),
                None => Value::Nil,
            };
            if tm.is_nil() {
                return vm.raw_set_checked(tid, *key, *value);
            }
            if tm.is_function() {
                return call_tm(vm, tm, &[cur, *key, *value]);
            }
            cur = tm;
        } else {
            let tm = tm_by_value(vm, &cur, TagMethod::NewIndex);
            if tm.is_nil() {
                let msg = format!("attempt to index a {} value", cur.type_name());
                return Err(vm.runtime_error(&msg));
            }
            if tm.is_function() {
                return call_tm(vm, tm, &[cur, *key, *value]);
            }
            cur = tm;
        }
    }
    Err(vm.runtime_error("'__newindex' chain too long; possible loop"))
}

// ===== Arithmetic =====

fn arith_tm(op: ArithOp) -> TagMethod {
    match op {
        ArithOp::Add => TagMethod::Add,
        ArithOp::Sub => TagMethod::Sub,
        ArithOp::Mul => TagMethod::Mul,
        ArithOp::Mod => TagMethod::Mod,
        ArithOp::Pow => TagMethod::Pow,
        ArithOp::Div => TagMethod::Div,
        ArithOp::IDiv => TagMethod::IDiv,
        ArithOp::BAnd => TagMethod::BAnd,
        ArithOp::BOr => TagMethod::BOr,
        ArithOp::BXor => TagMethod::BXor,
        ArithOp::Shl => TagMethod::Shl,
        ArithOp::Shr => TagMethod::Shr,
        ArithOp::Unm => TagMethod::Unm,
        ArithOp::BNot => TagMethod::BNot,
    }
}

/// Arithmetic coercion: numbers pass, strings that parse as numbers
/// convert.
fn coerce_number(vm: &LuaVM, v: &Value) -> Option<Value> {
    match v {
        Value::Int(_) | Value::Float(_) => Some(*v),
        Value::Str(id) => {
            let s = vm.pool.string(*id);
            let text = s.as_str()?;
            crate::compiler::parse_number::str_to_number(text)
        }
        _ => None,
    }
}

/// The full arithmetic path: raw numeric op, string coercion, then the
/// metamethod on either operand (left first).
pub fn arith(vm: &mut LuaVM, op: ArithOp, a: Value, b: Value) -> LuaResult<Value> {
    if let (Some(ca), Some(cb)) = (coerce_number(vm, &a), coerce_number(vm, &b)) {
        if let Some(r) = raw_arith(op, ca, cb) {
            return Ok(r);
        }
        // Numeric operands but no result: integer division by zero or an
        // inexact bitwise operand.
        match op {
            ArithOp::IDiv | ArithOp::Mod => {
                return Err(vm.runtime_error("attempt to perform 'n//0'"));
            }
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
            | ArithOp::BNot => {
                return Err(
                    vm.runtime_error("number has no integer representation")
                );
            }
            _ => {}
        }
    }
    let event = arith_tm(op);
    let tm = {
        let t = tm_by_value(vm, &a, event);
        if t.is_nil() {
            tm_by_value(vm, &b, event)
        } else {
            t
        }
    };
    if tm.is_nil() {
        let bad = if coerce_number(vm, &a).is_none() { a } else { b };
        let what = match op {
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
            | ArithOp::BNot => "perform bitwise operation on",
            _ => "perform arithmetic on",
        };
        let msg = format!("attempt to {} a {} value", what, bad.type_name());
        return Err(vm.runtime_error(&msg));
    }
    call_tm_res(vm, tm, &[a, b])
}

// ===== Comparison =====

fn string_lt(vm: &LuaVM, a: Value, b: Value) -> Option<(bool, bool)> {
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        let bx = vm.pool.string(x).as_bytes();
        let by = vm.pool.string(y).as_bytes();
        Some((bx < by, bx <= by))
    } else {
        None
    }
}

pub fn less_than(vm: &mut LuaVM, a: Value, b: Value) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(num_lt(&a, &b).expect("numbers compare"));
    }
    if let Some((lt, _)) = string_lt(vm, a, b) {
        return Ok(lt);
    }
    let tm = {
        let t = tm_by_value(vm, &a, TagMethod::Lt);
        if t.is_nil() {
            tm_by_value(vm, &b, TagMethod::Lt)
        } else {
            t
        }
    };
    if !tm.is_nil() {
        let r = call_tm_res(vm, tm, &[a, b])?;
        return Ok(r.is_truthy());
    }
    Err(order_error(vm, &a, &b))
}

pub fn less_equal(vm: &mut LuaVM, a: Value, b: Value) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(num_le(&a, &b).expect("numbers compare"));
    }
    if let Some((_, le)) = string_lt(vm, a, b) {
        return Ok(le);
    }
    let tm = {
        let t = tm_by_value(vm, &a, TagMethod::Le);
        if t.is_nil() {
            tm_by_value(vm, &b, TagMethod::Le)
        } else {
            t
        }
    };
    if !tm.is_nil() {
        let r = call_tm_res(vm, tm, &[a, b])?;
        return Ok(r.is_truthy());
    }
    // Only __lt defined: a <= b iff not (b < a).
    let tm = {
        let t = tm_by_value(vm, &a, TagMethod::Lt);
        if t.is_nil() {
            tm_by_value(vm, &b, TagMethod::Lt)
        } else {
            t
        }
    };
    if !tm.is_nil() {
        let r = call_tm_res(vm, tm, &[b, a])?;
        return Ok(r.is_falsy());
    }
    Err(order_error(vm, &a, &b))
}

fn order_error(vm: &mut LuaVM, a: &Value, b: &Value) -> crate::lua_vm::LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    let msg = if ta == tb {
        format!("attempt to compare two {} values", ta)
    } else {
        format!("attempt to compare {} with {}", ta, tb)
    };
    vm.runtime_error(&msg)
}

/// Equality with __eq, consulted only when both operands are the same
/// (table or userdata) type and raw-unequal.
pub fn values_equal(vm: &mut LuaVM, a: Value, b: Value) -> LuaResult<bool> {
    if a.raw_equal(&b, &vm.pool) {
        return Ok(true);
    }
    let same_kind = matches!(
        (a, b),
        (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
    );
    if !same_kind {
        return Ok(false);
    }
    let tm = {
        let t = tm_by_value(vm, &a, TagMethod::Eq);
        if t.is_nil() {
            tm_by_value(vm, &b, TagMethod::Eq)
        } else {
            t
        }
    };
    if tm.is_nil() {
        return Ok(false);
    }
    let r = call_tm_res(vm, tm, &[a, b])?;
    Ok(r.is_truthy())
}

// ===== Length =====

pub fn length_of(vm: &mut LuaVM, v: Value) -> LuaResult<Value> {
    match v {
        Value::Str(id) => Ok(Value::Int(vm.pool.string(id).len() as i64)),
        Value::Table(tid) => {
            let tm = match vm.pool.table(tid).metatable() {
                Some(mt) => get_tm(vm, mt, TagMethod::Len),
                None => Value::Nil,
            };
            if tm.is_nil() {
                Ok(Value::Int(vm.pool.table_len(tid)))
            } else {
                call_tm_res(vm, tm, &[v, v])
            }
        }
        _ => {
            let tm = tm_by_value(vm, &v, TagMethod::Len);
            if tm.is_nil() {
                let msg = format!("attempt to get length of a {} value", v.type_name());
                Err(vm.runtime_error(&msg))
            } else {
                call_tm_res(vm, tm, &[v, v])
            }
        }
    }
}

// ===== Concatenation =====

/// Number-to-string coercion on the concat path.
fn coerce_to_bytes(vm: &LuaVM, v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Str(id) => Some(vm.pool.string(*id).as_bytes().to_vec()),
        Value::Int(i) => Some(fmt_int(*i).into_bytes()),
        Value::Float(f) => Some(fmt_float(*f).into_bytes()),
        _ => None,
    }
}

/// Concatenate the `n` values ending at stack slot `last` (inclusive),
/// leaving the result in the first slot of the run. Consecutive
/// string/number operands collapse in one pass; other values go through
/// __concat right to left.
pub fn concat_range(vm: &mut LuaVM, th: ThreadId, first: usize, mut n: usize) -> LuaResult<()> {
    while n > 1 {
        let top = first + n;
        let b = vm.pool.thread(th).get(top - 2);
        let c = vm.pool.thread(th).get(top - 1);
        let b_ok = coerce_to_bytes(vm, &b).is_some();
        let c_ok = coerce_to_bytes(vm, &c).is_some();
        if b_ok && c_ok {
            // Collapse the longest string/number run ending here.
            let mut start = top - 2;
            while start > first {
                let prev = vm.pool.thread(th).get(start - 1);
                if coerce_to_bytes(vm, &prev).is_none() {
                    break;
                }
                start -= 1;
            }
            let mut bytes = Vec::new();
            for i in start..top {
                let v = vm.pool.thread(th).get(i);
                bytes.extend_from_slice(&coerce_to_bytes(vm, &v).expect("coercible"));
            }
            let s = vm.pool.new_string_bytes(&mut vm.gc, &bytes);
            vm.pool.thread_mut(th).set(start, Value::Str(s));
            n -= top - start - 1;
            vm.maybe_gc_step();
        } else {
            let tm = {
                let t = tm_by_value(vm, &b, TagMethod::Concat);
                if t.is_nil() {
                    tm_by_value(vm, &c, TagMethod::Concat)
                } else {
                    t
                }
            };
            if tm.is_nil() {
                let bad = if b_ok { c } else { b };
                let msg = format!("attempt to concatenate a {} value", bad.type_name());
                return Err(vm.runtime_error(&msg));
            }
            let r = call_tm_res(vm, tm, &[b, c])?;
            vm.pool.thread_mut(th).set(top - 2, r);
            n -= 1;
        }
    }
    Ok(())
}

/// tostring semantics shared by the VM and the basic library.
pub fn tostring_value(vm: &mut LuaVM, v: Value) -> LuaResult<Value> {
    let tm = tm_by_value(vm, &v, TagMethod::ToString);
    if !tm.is_nil() {
        let r = call_tm_res(vm, tm, &[v])?;
        if !r.is_string() {
            return Err(vm.runtime_error("'__tostring' must return a string"));
        }
        return Ok(r);
    }
    let s = match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
        Value::Int(i) => fmt_int(i),
        Value::Float(f) => fmt_float(f),
        Value::Str(_) => return Ok(v),
        Value::Table(id) => format!("table: 0x{:08x}", id.0),
        Value::Func(id) => format!("function: 0x{:08x}", id.0),
        Value::UserData(id) => format!("userdata: 0x{:08x}", id.0),
        Value::Thread(id) => format!("thread: 0x{:08x}", id.0),
        Value::LightPtr(p) => format!("userdata: 0x{:012x}", p),
    };
    Ok(vm.new_str_value(&s))
}
