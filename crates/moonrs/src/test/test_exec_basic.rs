use crate::test::{as_float, as_int, run, run_bool, run_int, run_string};
use crate::lua_value::Value;

#[test]
fn test_return_constants() {
    let values = run("return 1, 2.5, 'x', true, nil");
    assert_eq!(as_int(&values[0]), 1);
    assert_eq!(as_float(&values[1]), 2.5);
    assert!(matches!(values[3], Value::Bool(true)));
    assert!(values[4].is_nil());
}

#[test]
fn test_integer_arithmetic() {
    assert_eq!(run_int("return 1 + 2 * 3"), 7);
    assert_eq!(run_int("return (1 + 2) * 3"), 9);
    assert_eq!(run_int("return 2^10 // 1"), 1024);
    assert_eq!(run_int("return 7 % 3"), 1);
    assert_eq!(run_int("return -7 % 3"), 2);
    assert_eq!(run_int("return 7 // 2"), 3);
    assert_eq!(run_int("return -7 // 2"), -4);
}

#[test]
fn test_integer_wraparound() {
    assert_eq!(
        run_int("local maxi = 0x7fffffffffffffff return maxi + 1"),
        i64::MIN
    );
}

#[test]
fn test_float_arithmetic() {
    let values = run("return 1 / 2, 3.5 + 0.5, 2^0.5");
    assert_eq!(as_float(&values[0]), 0.5);
    assert_eq!(as_float(&values[1]), 4.0);
    assert!((as_float(&values[2]) - 2.0_f64.sqrt()).abs() < 1e-12);
}

#[test]
fn test_mixed_arithmetic_promotes() {
    let values = run("return 1 + 0.5");
    assert!(matches!(values[0], Value::Float(f) if f == 1.5));
    // Integer-only keeps the subtype.
    let values = run("return 1 + 2");
    assert!(matches!(values[0], Value::Int(3)));
}

#[test]
fn test_float_div_by_zero_is_inf() {
    let values = run("return 1/0, -1/0, 0/0");
    assert!(matches!(values[0], Value::Float(f) if f.is_infinite() && f > 0.0));
    assert!(matches!(values[1], Value::Float(f) if f.is_infinite() && f < 0.0));
    assert!(matches!(values[2], Value::Float(f) if f.is_nan()));
}

#[test]
fn test_integer_div_by_zero_raises() {
    let msg = crate::test::run_err("return 1 // 0");
    assert!(msg.contains("n//0"), "message was: {}", msg);
}

#[test]
fn test_bitwise() {
    assert_eq!(run_int("return 0xF0 & 0x3C"), 0x30);
    assert_eq!(run_int("return 0xF0 | 0x0F"), 0xFF);
    assert_eq!(run_int("return 5 ~ 3"), 6);
    assert_eq!(run_int("return ~0"), -1);
    assert_eq!(run_int("return 1 << 8"), 256);
    assert_eq!(run_int("return 256 >> 8"), 1);
    // Out-of-range shifts give zero.
    assert_eq!(run_int("return 1 << 100"), 0);
}

#[test]
fn test_comparison() {
    assert!(run_bool("return 1 < 2"));
    assert!(run_bool("return 2 <= 2"));
    assert!(run_bool("return 'a' < 'b'"));
    assert!(run_bool("return 'abc' < 'abd'"));
    assert!(!run_bool("return 1 == 1.5"));
    assert!(run_bool("return 1 == 1.0"));
    assert!(run_bool("return 1 ~= '1'"));
    // NaN compares unequal to everything, itself included.
    assert!(!run_bool("local nan = 0/0 return nan == nan"));
}

#[test]
fn test_logic_operators() {
    assert_eq!(run_int("return false or 5"), 5);
    assert_eq!(run_int("return nil and 1 or 2"), 2);
    assert_eq!(run_int("return 1 and 2"), 2);
    assert!(run_bool("return not nil"));
    assert!(!run_bool("return not 0"));
}

#[test]
fn test_locals_and_assignment() {
    assert_eq!(run_int("local a = 1 local b = 2 a, b = b, a return a * 10 + b"), 21);
    let values = run("local a, b = 1 return a, b");
    assert_eq!(as_int(&values[0]), 1);
    assert!(values[1].is_nil());
    // Extra values on the right are evaluated then dropped.
    assert_eq!(run_int("local a, b = 1, 2, 3 return a + b"), 3);
}

#[test]
fn test_assignment_conflict_avoidance() {
    // The table t is also an assignment target; semantics must match a
    // simultaneous assignment.
    assert_eq!(
        run_int("local t = {1} local x t[1], x = 10, t return x[1]"),
        10
    );
    assert_eq!(
        run_int("local i = 1 local t = {5, 6} i, t[i] = 2, 7 return t[1]"),
        7
    );
}

#[test]
fn test_functions_and_returns() {
    assert_eq!(run_int("local function f(a, b) return a + b end return f(3, 4)"), 7);
    let values = run("local function f() return 1, 2, 3 end return f()");
    assert_eq!(values.len(), 3);
    assert_eq!(as_int(&values[2]), 3);
    // In the middle of a list, calls truncate to one value.
    let values = run("local function f() return 1, 2 end return f(), 10");
    assert_eq!(values.len(), 2);
    assert_eq!(as_int(&values[0]), 1);
    assert_eq!(as_int(&values[1]), 10);
}

#[test]
fn test_varargs() {
    assert_eq!(
        run_int("local function f(...) local a, b = ... return a + b end return f(10, 20, 30)"),
        30
    );
    assert_eq!(run_int("local function f(...) return select('#', ...) end return f(1, nil, 3)"), 3);
    let values = run("local function f(...) return ... end return f(7, 8)");
    assert_eq!(values.len(), 2);
}

#[test]
fn test_tail_call_deep_recursion() {
    // A non-reusing frame chain would overflow long before a million.
    assert_eq!(
        run_int(
            r#"
            local function loop(n, acc)
                if n == 0 then return acc end
                return loop(n - 1, acc + 1)
            end
            return loop(100000, 0)
            "#
        ),
        100000
    );
}

#[test]
fn test_method_call_sugar() {
    assert_eq!(
        run_int(
            r#"
            local obj = { base = 10 }
            function obj:get(extra) return self.base + extra end
            return obj:get(5)
            "#
        ),
        15
    );
}

#[test]
fn test_string_number_coercion() {
    assert_eq!(run_int("return '10' + 5"), 15);
    assert_eq!(run_string("return 1 .. 2"), "12");
    assert_eq!(run_string("return 'x' .. 1.5"), "x1.5");
}

#[test]
fn test_tostring_tonumber() {
    assert_eq!(run_string("return tostring(12)"), "12");
    assert_eq!(run_string("return tostring(1.5)"), "1.5");
    assert_eq!(run_string("return tostring(nil)"), "nil");
    assert_eq!(run_int("return tonumber('42')"), 42);
    assert_eq!(run_int("return tonumber('ff', 16)"), 255);
    assert!(run("return tonumber('zz')")[0].is_nil());
    assert_eq!(run_string("return tostring(tonumber('1.25'))"), "1.25");
}

#[test]
fn test_select() {
    assert_eq!(run_int("return select('#', 'a', 'b', 'c')"), 3);
    assert_eq!(run_string("return select(2, 'a', 'b', 'c')"), "b");
    assert_eq!(run_string("return (select(-1, 'a', 'b'))"), "b");
}
