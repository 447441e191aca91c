use crate::lua_value::Value;
use crate::lua_vm::{LuaVM, VmOptions};
use crate::test::{run_bool, run_int};

#[test]
fn test_collectgarbage_runs() {
    assert_eq!(
        run_int(
            r#"
            for i = 1, 1000 do
                local t = {i, i + 1, tostring(i)}
            end
            collectgarbage()
            return 1
            "#
        ),
        1
    );
}

#[test]
fn test_reachable_objects_survive_full_gc() {
    assert_eq!(
        run_int(
            r#"
            local keep = {}
            for i = 1, 100 do keep[i] = {value = i} end
            collectgarbage()
            collectgarbage()
            local sum = 0
            for i = 1, 100 do sum = sum + keep[i].value end
            return sum
            "#
        ),
        5050
    );
}

#[test]
fn test_weak_values_cleared() {
    assert!(run_bool(
        r#"
        local t = setmetatable({}, { __mode = 'v' })
        t[1] = {}
        collectgarbage()
        return t[1] == nil
        "#
    ));
}

#[test]
fn test_weak_values_keep_reachable_entries() {
    assert!(run_bool(
        r#"
        local strong = {}
        local t = setmetatable({}, { __mode = 'v' })
        t[1] = strong
        t[2] = {}
        collectgarbage()
        return t[1] == strong and t[2] == nil
        "#
    ));
}

#[test]
fn test_weak_keys_cleared() {
    assert!(run_bool(
        r#"
        local t = setmetatable({}, { __mode = 'k' })
        local held = {}
        t[held] = 'kept'
        t[{}] = 'dropped'
        collectgarbage()
        local count = 0
        for _ in pairs(t) do count = count + 1 end
        return count == 1 and t[held] == 'kept'
        "#
    ));
}

#[test]
fn test_weak_tables_never_drop_string_values() {
    assert!(run_bool(
        r#"
        local t = setmetatable({}, { __mode = 'v' })
        t[1] = 'an interned string'
        collectgarbage()
        return t[1] ~= nil
        "#
    ));
}

#[test]
fn test_string_interning_survives_collection() {
    assert!(run_bool(
        r#"
        local a = 'persist'
        collectgarbage()
        local b = 'per' .. 'sist'
        return rawequal(a, b)
        "#
    ));
}

#[test]
fn test_quiescent_full_gc_is_stable() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    vm.execute_string("keep = {} for i = 1, 50 do keep[i] = {i} end")
        .unwrap();
    vm.gc_collect().unwrap();
    let a = vm.gc_count_bytes();
    vm.gc_collect().unwrap();
    let b = vm.gc_count_bytes();
    assert_eq!(a, b, "repeated full gc on a quiescent state is stable");
}

#[test]
fn test_gc_stop_restart() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    assert!(vm.gc_is_running());
    vm.gc_stop();
    assert!(!vm.gc_is_running());
    vm.gc_restart();
    assert!(vm.gc_is_running());
}

#[test]
fn test_unreachable_coroutine_is_collected() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    let before = vm.pool.threads.len();
    vm.execute_string(
        r#"
        local co = coroutine.create(function() coroutine.yield() end)
        coroutine.resume(co)
        "#,
    )
    .unwrap();
    vm.gc_collect().unwrap();
    vm.gc_collect().unwrap();
    assert_eq!(vm.pool.threads.len(), before, "suspended orphan was swept");
}

#[test]
fn test_userdata_finalizer_runs_once() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    // Pause collection while the metatable and closure are only
    // reachable from Rust locals.
    vm.gc_stop();
    // __gc sets a global flag when the userdata dies.
    vm.execute_string("finalized = 0").unwrap();
    let mt = vm.new_table(0, 2);
    let gc_fn = vm
        .execute_string("return function() finalized = finalized + 1 end")
        .unwrap()[0];
    let key = vm.consts.tm_name(crate::lua_vm::TagMethod::Gc);
    vm.raw_set(mt, Value::Str(key), gc_fn).unwrap();

    let ud = vm.new_userdata(Box::new(42i32));
    vm.set_metatable(&Value::UserData(ud), Some(mt)).unwrap();
    // Keep the metatable reachable through a global; drop the userdata.
    vm.set_global("the_mt", Value::Table(mt));
    vm.gc_restart();

    vm.gc_collect().unwrap();
    vm.gc_collect().unwrap();
    vm.gc_collect().unwrap();
    let flag = vm.get_global("finalized");
    assert!(
        matches!(flag, Value::Int(1)),
        "finalizer ran exactly once, got {:?}",
        flag
    );
}

#[test]
fn test_incremental_steps_make_progress() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    vm.execute_string("for i = 1, 2000 do local _ = {'garbage', i} end")
        .unwrap();
    // Step repeatedly; the cycle must terminate and reclaim the garbage.
    for _ in 0..10_000 {
        vm.gc_step();
    }
    vm.gc_collect().unwrap();
    assert!(vm.pool.tables.len() < 2100, "garbage tables were reclaimed");
}
