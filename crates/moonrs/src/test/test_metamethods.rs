use crate::test::{run_bool, run_err, run_int, run_string};

#[test]
fn test_index_function() {
    assert_eq!(
        run_int(
            r#"
            local t = setmetatable({}, { __index = function(_, k) return #k end })
            return t.abc + t.de
            "#
        ),
        5
    );
}

#[test]
fn test_index_chain_through_tables() {
    assert_eq!(
        run_int(
            r#"
            local base = { foo = 1 }
            local mid = setmetatable({}, { __index = base })
            local top = setmetatable({}, { __index = mid })
            return top.foo
            "#
        ),
        1
    );
}

#[test]
fn test_index_prefers_raw_entry() {
    assert_eq!(
        run_int(
            r#"
            local t = setmetatable({ x = 5 }, { __index = function() return 99 end })
            return t.x
            "#
        ),
        5
    );
}

#[test]
fn test_newindex_function() {
    assert_eq!(
        run_int(
            r#"
            local log = {}
            local t = setmetatable({}, {
                __newindex = function(_, k, v) log[#log + 1] = v end
            })
            t.a = 10
            t.b = 20
            return log[1] + log[2] + (rawget(t, 'a') == nil and 1 or 0)
            "#
        ),
        31
    );
}

#[test]
fn test_newindex_table_redirect() {
    assert_eq!(
        run_int(
            r#"
            local store = {}
            local t = setmetatable({}, { __newindex = store })
            t.x = 7
            return store.x + (rawget(t, 'x') == nil and 1 or 0)
            "#
        ),
        8
    );
}

#[test]
fn test_arith_metamethods() {
    assert_eq!(
        run_int(
            r#"
            local mt = {}
            mt.__add = function(a, b) return a.v + b.v end
            mt.__mul = function(a, b) return a.v * b.v end
            local x = setmetatable({v = 3}, mt)
            local y = setmetatable({v = 4}, mt)
            return (x + y) + (x * y)
            "#
        ),
        19
    );
}

#[test]
fn test_arith_metamethod_on_right_operand() {
    assert_eq!(
        run_int(
            r#"
            local mt = { __add = function(a, b) return b.v + a end }
            local y = setmetatable({v = 40}, mt)
            return 2 + y
            "#
        ),
        42
    );
}

#[test]
fn test_unm_and_len() {
    assert_eq!(
        run_int(
            r#"
            local mt = {
                __unm = function(a) return -a.v end,
                __len = function(a) return a.v * 2 end,
            }
            local x = setmetatable({v = 21}, mt)
            return -x + #x
            "#
        ),
        21
    );
}

#[test]
fn test_eq_only_for_same_type() {
    assert!(run_bool(
        r#"
        local mt = { __eq = function() return true end }
        local a = setmetatable({}, mt)
        local b = setmetatable({}, mt)
        return a == b
        "#
    ));
    // Raw-equal values never consult __eq.
    assert!(run_bool(
        r#"
        local mt = { __eq = function() return false end }
        local a = setmetatable({}, mt)
        return a == a
        "#
    ));
    // Different primitive types never consult __eq.
    assert!(!run_bool(
        r#"
        local mt = { __eq = function() return true end }
        local a = setmetatable({}, mt)
        return a == 5
        "#
    ));
}

#[test]
fn test_lt_le_and_le_fallback() {
    assert!(run_bool(
        r#"
        local mt = { __lt = function(a, b) return a.v < b.v end }
        local a = setmetatable({v = 1}, mt)
        local b = setmetatable({v = 2}, mt)
        return a < b
        "#
    ));
    // With only __lt defined, a <= b evaluates as not (b < a).
    assert!(run_bool(
        r#"
        local mt = { __lt = function(a, b) return a.v < b.v end }
        local a = setmetatable({v = 2}, mt)
        local b = setmetatable({v = 2}, mt)
        return a <= b
        "#
    ));
}

#[test]
fn test_call_metamethod() {
    assert_eq!(
        run_int(
            r#"
            local callable = setmetatable({}, {
                __call = function(self, a, b) return a + b end
            })
            return callable(20, 22)
            "#
        ),
        42
    );
}

#[test]
fn test_concat_metamethod() {
    assert_eq!(
        run_string(
            r#"
            local mt = { __concat = function(a, b)
                local av = type(a) == 'table' and a.v or a
                local bv = type(b) == 'table' and b.v or b
                return av .. '/' .. bv
            end }
            local x = setmetatable({v = 'X'}, mt)
            return 'pre' .. x
            "#
        ),
        "pre/X"
    );
}

#[test]
fn test_tostring_metamethod() {
    assert_eq!(
        run_string(
            r#"
            local x = setmetatable({}, { __tostring = function() return 'custom' end })
            return tostring(x)
            "#
        ),
        "custom"
    );
}

#[test]
fn test_metatable_protection() {
    assert_eq!(
        run_string(
            r#"
            local t = setmetatable({}, { __metatable = 'locked' })
            return getmetatable(t)
            "#
        ),
        "locked"
    );
    let msg = run_err(
        r#"
        local t = setmetatable({}, { __metatable = 'locked' })
        setmetatable(t, {})
        "#,
    );
    assert!(msg.contains("protected metatable"), "message: {}", msg);
}

#[test]
fn test_index_on_non_table_errors() {
    let msg = run_err("local x = nil return x.field");
    assert!(msg.contains("index"), "message: {}", msg);
    let msg = run_err("local x = 5 x.field = 1");
    assert!(msg.contains("index"), "message: {}", msg);
}

#[test]
fn test_pairs_metamethod() {
    assert_eq!(
        run_int(
            r#"
            local t = setmetatable({}, { __pairs = function(t)
                local n = 0
                return function()
                    n = n + 1
                    if n <= 3 then return n, n * 10 end
                end, t, nil
            end })
            local sum = 0
            for _, v in pairs(t) do sum = sum + v end
            return sum
            "#
        ),
        60
    );
}
