// Coroutine wrappers over the core resume/yield engine.

use crate::lua_value::Value;
use crate::lua_vm::execute::{do_yield, ResumeOutcome};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub fn open(vm: &mut LuaVM) {
    let t = vm.new_table(0, 8);
    super::register_into(
        vm,
        t,
        &[
            ("create", lua_create),
            ("resume", lua_resume),
            ("yield", lua_yield),
            ("status", lua_status),
            ("wrap", lua_wrap),
            ("isyieldable", lua_isyieldable),
            ("running", lua_running),
        ],
    );
    vm.set_global("coroutine", Value::Table(t));
}

fn check_function(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<Value> {
    let v = vm.arg(n);
    if v.is_function() {
        Ok(v)
    } else {
        let msg = format!(
            "bad argument #{} to '{}' (function expected, got {})",
            n,
            fname,
            v.type_name()
        );
        Err(vm.runtime_error(&msg))
    }
}

fn lua_create(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_function(vm, 1, "create")?;
    let co = vm.new_thread();
    // The main closure waits at the stack bottom until the first resume.
    vm.pool.thread_mut(co).push(f);
    vm.push(Value::Thread(co));
    Ok(1)
}

fn lua_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = match vm.arg(1) {
        Value::Thread(id) => id,
        v => {
            let msg = format!(
                "bad argument #1 to 'resume' (coroutine expected, got {})",
                v.type_name()
            );
            return Err(vm.runtime_error(&msg));
        }
    };
    let args: Vec<Value> = (2..=vm.arg_count()).map(|i| vm.arg(i)).collect();
    match vm.resume_thread(co, args)? {
        ResumeOutcome::Finished(values) | ResumeOutcome::Yielded(values) => {
            vm.push(Value::Bool(true));
            let n = values.len();
            for v in values {
                vm.push(v);
            }
            Ok(n + 1)
        }
        ResumeOutcome::Failed(err) => {
            vm.push(Value::Bool(false));
            vm.push(err);
            Ok(2)
        }
    }
}

fn lua_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    let values: Vec<Value> = (1..=vm.arg_count()).map(|i| vm.arg(i)).collect();
    Err(do_yield(vm, values))
}

fn lua_status(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = match vm.arg(1) {
        Value::Thread(id) => id,
        v => {
            let msg = format!(
                "bad argument #1 to 'status' (coroutine expected, got {})",
                v.type_name()
            );
            return Err(vm.runtime_error(&msg));
        }
    };
    let s = vm.coroutine_status(co);
    let sv = vm.new_str_value(s);
    vm.push(sv);
    Ok(1)
}

fn lua_wrap(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_function(vm, 1, "wrap")?;
    let co = vm.new_thread();
    vm.pool.thread_mut(co).push(f);
    let wrapper = vm.push_host_closure(wrap_helper, vec![Value::Thread(co)]);
    vm.push(wrapper);
    Ok(1)
}

/// The callable produced by coroutine.wrap: resumes its captured thread
/// and re-raises its errors.
fn wrap_helper(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = vm
        .host_upvalue(1)
        .as_thread_id()
        .expect("wrapped coroutine");
    let args: Vec<Value> = (1..=vm.arg_count()).map(|i| vm.arg(i)).collect();
    match vm.resume_thread(co, args)? {
        ResumeOutcome::Finished(values) | ResumeOutcome::Yielded(values) => {
            let n = values.len();
            for v in values {
                vm.push(v);
            }
            Ok(n)
        }
        ResumeOutcome::Failed(err) => {
            vm.set_error_value(err);
            Err(LuaError::RuntimeError)
        }
    }
}

fn lua_isyieldable(vm: &mut LuaVM) -> LuaResult<usize> {
    let yieldable = vm.current_thread_id() != vm.main_thread();
    vm.push(Value::Bool(yieldable));
    Ok(1)
}

fn lua_running(vm: &mut LuaVM) -> LuaResult<usize> {
    let cur = vm.current_thread_id();
    let is_main = cur == vm.main_thread();
    vm.push(Value::Thread(cur));
    vm.push(Value::Bool(is_main));
    Ok(2)
}
