use crate::lua_value::Value;
use crate::lua_vm::{LuaVM, VmOptions};
use crate::test::{run_bool, run_err, run_int};

#[test]
fn test_constructor_forms() {
    assert_eq!(run_int("local t = {10, 20, 30} return t[1] + t[2] + t[3]"), 60);
    assert_eq!(run_int("local t = {x = 1, y = 2} return t.x + t.y"), 3);
    assert_eq!(run_int("local t = {[2 + 2] = 9} return t[4]"), 9);
    assert_eq!(
        run_int("local t = {1, 2, x = 10, 3; 4} return t[4] + t.x"),
        14
    );
}

#[test]
fn test_constructor_tail_call_expands() {
    assert_eq!(
        run_int(
            r#"
            local function three() return 7, 8, 9 end
            local t = {three()}
            return #t * 100 + t[3]
            "#
        ),
        309
    );
    // Not in tail position: truncated to one value.
    assert_eq!(
        run_int(
            r#"
            local function three() return 7, 8, 9 end
            local t = {three(), 1}
            return #t
            "#
        ),
        2
    );
}

#[test]
fn test_length_border() {
    assert_eq!(run_int("return #{1, 2, 3}"), 3);
    assert_eq!(run_int("return #{}"), 0);
    assert_eq!(run_int("local t = {1, 2, 3} t[4] = 4 return #t"), 4);
    assert_eq!(run_int("local t = {1, 2, 3} t[3] = nil return #t"), 2);
}

#[test]
fn test_array_growth_and_shrink() {
    assert_eq!(
        run_int(
            r#"
            local t = {}
            for i = 1, 100 do t[i] = i end
            local sum = 0
            for i = 1, 100 do sum = sum + t[i] end
            for i = 51, 100 do t[i] = nil end
            return sum + #t
            "#
        ),
        5050 + 50
    );
}

#[test]
fn test_nil_write_deletes() {
    assert!(run_bool(
        r#"
        local t = {x = 1}
        t.x = nil
        return t.x == nil and next(t) == nil
        "#
    ));
}

#[test]
fn test_mixed_keys() {
    assert_eq!(
        run_int(
            r#"
            local t = {}
            t[1] = 1
            t['one'] = 10
            t[2.5] = 100
            t[true] = 1000
            return t[1] + t.one + t[2.5] + t[true]
            "#
        ),
        1111
    );
}

#[test]
fn test_float_keys_normalize_to_int() {
    assert!(run_bool("local t = {} t[1] = 'x' return t[1.0] == 'x'"));
    assert!(run_bool("local t = {} t[2.0] = 'y' return t[2] == 'y'"));
}

#[test]
fn test_nil_key_raises() {
    let msg = run_err("local t = {} t[nil] = 1");
    assert!(msg.contains("table index is nil"), "message: {}", msg);
    let msg = run_err("local t = {} t[0/0] = 1");
    assert!(msg.contains("NaN"), "message: {}", msg);
}

#[test]
fn test_reading_nil_key_is_fine() {
    assert!(run_bool("local t = {} return t[nil] == nil"));
}

#[test]
fn test_next_iterates_everything() {
    assert_eq!(
        run_int(
            r#"
            local t = {10, 20, a = 1, b = 2}
            local count, sum = 0, 0
            local k, v = next(t)
            while k ~= nil do
                count = count + 1
                sum = sum + v
                k, v = next(t, k)
            end
            return count * 1000 + sum
            "#
        ),
        4033
    );
}

#[test]
fn test_next_invalid_key_errors() {
    let msg = run_err("next({}, 'ghost')");
    assert!(msg.contains("invalid key"), "message: {}", msg);
}

#[test]
fn test_many_string_keys_with_collisions() {
    // Enough churn to force several rehashes and Brent displacements.
    assert_eq!(
        run_int(
            r#"
            local t = {}
            for i = 1, 200 do
                t['key' .. i] = i
            end
            for i = 1, 200, 2 do
                t['key' .. i] = nil
            end
            local sum = 0
            for i = 1, 200 do
                sum = sum + (t['key' .. i] or 0)
            end
            return sum
            "#
        ),
        (2..=200).step_by(2).sum::<i64>()
    );
}

#[test]
fn test_rawget_rawset_bypass_metamethods() {
    assert_eq!(
        run_int(
            r#"
            local t = setmetatable({}, {
                __index = function() return 99 end,
                __newindex = function() error('blocked') end,
            })
            rawset(t, 'k', 5)
            return rawget(t, 'k')
            "#
        ),
        5
    );
    // rawget of an absent key is nil even with __index present.
    assert!(run_bool(
        r#"
        local t = setmetatable({}, { __index = function() return 99 end })
        return rawget(t, 'absent') == nil and t.absent == 99
        "#
    ));
}

#[test]
fn test_table_identity() {
    assert!(run_bool("local t = {} local u = t return rawequal(t, u)"));
    assert!(!run_bool("return rawequal({}, {})"));
}

#[test]
fn test_pool_level_table_ops() {
    let mut vm = LuaVM::new(VmOptions::default());
    let t = vm.new_table(4, 4);
    vm.raw_set(t, Value::Int(1), Value::Int(10)).unwrap();
    let k = vm.intern("name");
    vm.raw_set(t, Value::Str(k), Value::Bool(true)).unwrap();
    assert!(matches!(vm.raw_get(t, &Value::Int(1)), Value::Int(10)));
    assert!(matches!(vm.raw_get(t, &Value::Str(k)), Value::Bool(true)));
    assert_eq!(vm.raw_len(t), 1);
    // Delete and observe via next.
    vm.raw_set(t, Value::Int(1), Value::Nil).unwrap();
    let first = vm.table_next(t, &Value::Nil).unwrap();
    assert!(first.is_some());
    let (fk, _) = first.unwrap();
    assert!(matches!(fk, Value::Str(_)));
}
