// Basic library: the global functions every chunk expects. Each entry is
// a host function over the stack API; argument errors follow the
// reference wording ("bad argument #n to 'f'").

use crate::compiler::parse_number::{str_to_integer_radix, str_to_number};
use crate::gc::TableId;
use crate::lua_value::Value;
use crate::lua_vm::execute::{protected_call, tostring_value};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RecoveryKind, TagMethod};

pub fn open(vm: &mut LuaVM) {
    let g = vm.globals();
    super::register_into(
        vm,
        g,
        &[
            ("assert", lua_assert),
            ("collectgarbage", lua_collectgarbage),
            ("error", lua_error),
            ("getmetatable", lua_getmetatable),
            ("ipairs", lua_ipairs),
            ("load", lua_load),
            ("next", lua_next),
            ("pairs", lua_pairs),
            ("pcall", lua_pcall),
            ("print", lua_print),
            ("rawequal", lua_rawequal),
            ("rawget", lua_rawget),
            ("rawlen", lua_rawlen),
            ("rawset", lua_rawset),
            ("select", lua_select),
            ("setmetatable", lua_setmetatable),
            ("tonumber", lua_tonumber),
            ("tostring", lua_tostring),
            ("type", lua_type),
            ("xpcall", lua_xpcall),
        ],
    );
}

fn arg_error(vm: &mut LuaVM, n: usize, fname: &str, extra: &str) -> LuaError {
    let msg = format!("bad argument #{} to '{}' ({})", n, fname, extra);
    vm.runtime_error(&msg)
}

fn check_table(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<TableId> {
    match vm.arg(n) {
        Value::Table(t) => Ok(t),
        v => {
            let extra = format!("table expected, got {}", v.type_name());
            Err(arg_error(vm, n, fname, &extra))
        }
    }
}

fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let mut parts = Vec::with_capacity(n);
    for i in 1..=n {
        let v = vm.arg(i);
        let s = tostring_value(vm, v)?;
        parts.push(vm.string_of(&s).unwrap_or_default());
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 1 {
        return Err(arg_error(vm, 1, "type", "value expected"));
    }
    let name = vm.arg(1).type_name();
    let v = vm.new_str_value(name);
    vm.push(v);
    Ok(1)
}

fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 1 {
        return Err(arg_error(vm, 1, "tostring", "value expected"));
    }
    let v = vm.arg(1);
    let s = tostring_value(vm, v)?;
    vm.push(s);
    Ok(1)
}

fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.arg(1);
    if vm.arg_count() >= 2 && !vm.arg(2).is_nil() {
        let base = match vm.arg(2).as_int() {
            Some(b) if (2..=36).contains(&b) => b as u32,
            _ => return Err(arg_error(vm, 2, "tonumber", "base out of range")),
        };
        let parsed = match v {
            Value::Str(id) => vm
                .pool
                .string(id)
                .as_str()
                .and_then(|s| str_to_integer_radix(s, base))
                .map(Value::Int),
            _ => {
                let extra = format!("string expected, got {}", v.type_name());
                return Err(arg_error(vm, 1, "tonumber", &extra));
            }
        };
        vm.push(parsed.unwrap_or(Value::Nil));
        return Ok(1);
    }
    let out = match v {
        Value::Int(_) | Value::Float(_) => v,
        Value::Str(id) => {
            let text = vm.pool.string(id).as_str().map(|s| s.to_string());
            match text.and_then(|s| str_to_number(&s)) {
                Some(n) => n,
                None => Value::Nil,
            }
        }
        _ => Value::Nil,
    };
    vm.push(out);
    Ok(1)
}

fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 1 {
        return Err(arg_error(vm, 1, "ipairs", "value expected"));
    }
    let t = vm.arg(1);
    let iter = vm.push_host_closure(ipairs_iterator, Vec::new());
    vm.push(iter);
    vm.push(t);
    vm.push(Value::Int(0));
    Ok(3)
}

fn ipairs_iterator(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = vm.arg(1);
    let i = vm.arg(2).as_int().unwrap_or(0) + 1;
    let v = vm.get_field(t, &Value::Int(i))?;
    if v.is_nil() {
        vm.push(Value::Nil);
        Ok(1)
    } else {
        vm.push(Value::Int(i));
        vm.push(v);
        Ok(2)
    }
}

fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "next")?;
    let key = vm.arg(2);
    match vm.table_next(t, &key)? {
        Some((k, v)) => {
            vm.push(k);
            vm.push(v);
            Ok(2)
        }
        None => {
            vm.push(Value::Nil);
            Ok(1)
        }
    }
}

fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 1 {
        return Err(arg_error(vm, 1, "pairs", "value expected"));
    }
    let t = vm.arg(1);
    let tm = crate::lua_vm::execute::tm_by_value(vm, &t, TagMethod::Pairs);
    if !tm.is_nil() {
        let results = vm.call_function(tm, &[t])?;
        for i in 0..3 {
            vm.push(results.get(i).copied().unwrap_or(Value::Nil));
        }
        return Ok(3);
    }
    let next = vm.push_host_closure(lua_next, Vec::new());
    vm.push(next);
    vm.push(t);
    vm.push(Value::Nil);
    Ok(3)
}

fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let first = vm.arg(1);
    if let Value::Str(id) = first {
        if vm.pool.string(id).as_bytes() == b"#" {
            vm.push(Value::Int(n as i64 - 1));
            return Ok(1);
        }
    }
    let idx = match first.as_int() {
        Some(i) if i != 0 => i,
        _ => return Err(arg_error(vm, 1, "select", "number expected")),
    };
    let start = if idx < 0 {
        let back = (-idx) as usize;
        if back > n - 1 {
            return Err(arg_error(vm, 1, "select", "index out of range"));
        }
        n - back + 1
    } else {
        (idx as usize) + 1
    };
    let mut count = 0;
    for i in start..=n {
        let v = vm.arg(i);
        vm.push(v);
        count += 1;
    }
    Ok(count)
}

fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "rawget")?;
    let k = vm.arg(2);
    let v = vm.raw_get(t, &k);
    vm.push(v);
    Ok(1)
}

fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "rawset")?;
    let k = vm.arg(2);
    let v = vm.arg(3);
    vm.raw_set(t, k, v)?;
    vm.push(Value::Table(t));
    Ok(1)
}

fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 2 {
        return Err(arg_error(vm, 2, "rawequal", "value expected"));
    }
    let a = vm.arg(1);
    let b = vm.arg(2);
    let eq = a.raw_equal(&b, &vm.pool);
    vm.push(Value::Bool(eq));
    Ok(1)
}

fn lua_rawlen(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.arg(1);
    let len = match v {
        Value::Table(t) => vm.raw_len(t),
        Value::Str(id) => vm.pool.string(id).len() as i64,
        _ => {
            return Err(arg_error(vm, 1, "rawlen", "table or string expected"));
        }
    };
    vm.push(Value::Int(len));
    Ok(1)
}

fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "setmetatable")?;
    let mt = match vm.arg(2) {
        Value::Nil => None,
        Value::Table(m) => Some(m),
        _ => {
            return Err(arg_error(vm, 2, "setmetatable", "nil or table expected"));
        }
    };
    // A __metatable field protects the current metatable.
    if let Some(cur) = vm.get_metatable(&Value::Table(t)) {
        let guard = crate::lua_vm::execute::get_tm(vm, cur, TagMethod::Metatable);
        if !guard.is_nil() {
            return Err(vm.runtime_error("cannot change a protected metatable"));
        }
    }
    vm.set_metatable(&Value::Table(t), mt)?;
    vm.push(Value::Table(t));
    Ok(1)
}

fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.arg(1);
    match vm.get_metatable(&v) {
        None => {
            vm.push(Value::Nil);
        }
        Some(mt) => {
            let guard = crate::lua_vm::execute::get_tm(vm, mt, TagMethod::Metatable);
            if guard.is_nil() {
                vm.push(Value::Table(mt));
            } else {
                vm.push(guard);
            }
        }
    }
    Ok(1)
}

fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 1 {
        return Err(arg_error(vm, 1, "assert", "value expected"));
    }
    let v = vm.arg(1);
    if v.is_falsy() {
        let msg = vm.arg(2);
        if msg.is_nil() {
            return Err(vm.runtime_error("assertion failed!"));
        }
        vm.set_error_value(msg);
        return Err(LuaError::RuntimeError);
    }
    // Pass all arguments through.
    let n = vm.arg_count();
    for i in 1..=n {
        let v = vm.arg(i);
        vm.push(v);
    }
    Ok(n)
}

fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let msg = vm.arg(1);
    let level = vm.arg(2).as_int().unwrap_or(1);
    let obj = match msg {
        Value::Str(id) if level >= 1 => {
            // Prefix string errors with the caller's position.
            let text = vm.pool.string_display(id);
            match vm.current_position() {
                Some((src, line)) => {
                    let full = format!("{}:{}: {}", src, line, text);
                    vm.new_str_value(&full)
                }
                None => msg,
            }
        }
        _ => msg,
    };
    vm.set_error_value(obj);
    Err(LuaError::RuntimeError)
}

fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 1 {
        return Err(arg_error(vm, 1, "pcall", "value expected"));
    }
    let func_idx = vm.arg_index(1);
    let (ok, n) = protected_call(vm, func_idx, None, RecoveryKind::Pcall)?;
    // Insert the status boolean before the results.
    let th = vm.current_thread_id();
    let t = vm.pool.thread_mut(th);
    t.ensure_stack(t.top + 1);
    let mut i = t.top;
    while i > func_idx {
        let v = t.get(i - 1);
        t.set(i, v);
        i -= 1;
    }
    t.set(func_idx, Value::Bool(ok));
    let new_top = func_idx + n + 1;
    t.set_top(new_top);
    Ok(n + 1)
}

fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.arg_count() < 2 {
        return Err(arg_error(vm, 2, "xpcall", "value expected"));
    }
    let f = vm.arg(1);
    let handler_idx = vm.arg_index(2);
    let nargs = vm.arg_count() - 2;
    // Re-stage the call above the handler so it survives the unwind.
    let call_at = vm.top();
    vm.push(f);
    for i in 0..nargs {
        let v = vm.arg(3 + i);
        vm.push(v);
    }
    let (ok, n) = protected_call(vm, call_at, Some(handler_idx), RecoveryKind::Xpcall)?;
    let th = vm.current_thread_id();
    let t = vm.pool.thread_mut(th);
    t.ensure_stack(t.top + 1);
    let mut i = t.top;
    while i > call_at {
        let v = t.get(i - 1);
        t.set(i, v);
        i -= 1;
    }
    t.set(call_at, Value::Bool(ok));
    t.set_top(call_at + n + 1);
    Ok(n + 1)
}

fn lua_collectgarbage(vm: &mut LuaVM) -> LuaResult<usize> {
    let opt = match vm.arg(1) {
        Value::Nil => "collect".to_string(),
        Value::Str(id) => vm.pool.string_display(id),
        _ => return Err(arg_error(vm, 1, "collectgarbage", "string expected")),
    };
    match opt.as_str() {
        "collect" => {
            vm.gc_collect()?;
            vm.push(Value::Int(0));
        }
        "stop" => {
            vm.gc_stop();
            vm.push(Value::Int(0));
        }
        "restart" => {
            vm.gc_restart();
            vm.push(Value::Int(0));
        }
        "step" => {
            vm.gc_step();
            vm.push(Value::Bool(true));
        }
        "count" => {
            let kb = vm.gc_count_bytes() as f64 / 1024.0;
            vm.push(Value::Float(kb));
        }
        "isrunning" => {
            let running = vm.gc_is_running();
            vm.push(Value::Bool(running));
        }
        "setpause" => {
            let p = vm.arg(2).as_int().unwrap_or(200) as i32;
            let old = vm.gc_set_pause(p);
            vm.push(Value::Int(old as i64));
        }
        "setstepmul" => {
            let m = vm.arg(2).as_int().unwrap_or(200) as i32;
            let old = vm.gc_set_step_multiplier(m);
            vm.push(Value::Int(old as i64));
        }
        _ => {
            return Err(arg_error(vm, 1, "collectgarbage", "invalid option"));
        }
    }
    Ok(1)
}

fn lua_load(vm: &mut LuaVM) -> LuaResult<usize> {
    let chunk = vm.arg(1);
    let chunkname = match vm.arg(2) {
        Value::Str(id) => vm.pool.string_display(id),
        _ => "=(load)".to_string(),
    };
    let mode = match vm.arg(3) {
        Value::Str(id) => match vm.pool.string(id).as_bytes() {
            b"t" => crate::lua_vm::LoadMode::Text,
            b"b" => crate::lua_vm::LoadMode::Binary,
            _ => crate::lua_vm::LoadMode::Both,
        },
        _ => crate::lua_vm::LoadMode::Both,
    };
    let bytes: Vec<u8> = match chunk {
        Value::Str(id) => vm.pool.string(id).as_bytes().to_vec(),
        Value::Func(_) => {
            // Reader function: concatenate the pieces it returns.
            let mut out = Vec::new();
            loop {
                let piece = vm.call_function(chunk, &[])?;
                match piece.first() {
                    Some(Value::Str(id)) => {
                        let b = vm.pool.string(*id).as_bytes();
                        if b.is_empty() {
                            break;
                        }
                        out.extend_from_slice(b);
                    }
                    _ => break,
                }
            }
            out
        }
        _ => {
            return Err(arg_error(vm, 1, "load", "string or function expected"));
        }
    };
    let loaded = vm.load(
        Box::new(crate::compiler::SliceReader::new(&bytes)),
        &chunkname,
        mode,
    );
    match loaded {
        Ok(f) => {
            vm.push(f);
            Ok(1)
        }
        Err(_) => {
            let err = vm.take_error_value();
            vm.push(Value::Nil);
            vm.push(err);
            Ok(2)
        }
    }
}
