use crate::test::{run, run_int};

#[test]
fn test_counter_closure() {
    // A captured local keeps its identity across calls.
    assert_eq!(
        run_int(
            r#"
            local function mk()
                local x = 10
                return function() x = x + 1 return x end
            end
            local c = mk()
            local a, b, d = c(), c(), c()
            return a * 10000 + b * 100 + d
            "#
        ),
        11 * 10000 + 12 * 100 + 13
    );
}

#[test]
fn test_shared_upvalue() {
    assert_eq!(
        run_int(
            r#"
            local function make()
                local value = 10
                return function() return value end,
                       function(v) value = v end
            end
            local get, set = make()
            set(42)
            return get()
            "#
        ),
        42
    );
}

#[test]
fn test_nested_capture_through_levels() {
    assert_eq!(
        run_int(
            r#"
            local function outer(x)
                return function(y)
                    return function(z) return x + y + z end
                end
            end
            return outer(1)(2)(3) + outer(10)(20)(30)
            "#
        ),
        6 + 60
    );
}

#[test]
fn test_loop_variable_capture() {
    // Each iteration of a for loop gets a fresh cell.
    assert_eq!(
        run_int(
            r#"
            local fns = {}
            for i = 1, 5 do
                fns[i] = function() return i end
            end
            return fns[1]() + fns[3]() * 10 + fns[5]() * 100
            "#
        ),
        1 + 30 + 500
    );
}

#[test]
fn test_block_exit_closes_upvalue() {
    // After the block ends, the closure must see the last written value,
    // not a reused stack slot.
    assert_eq!(
        run_int(
            r#"
            local f
            do
                local hidden = 7
                f = function() return hidden end
                hidden = 8
            end
            local clobber = 99
            return f() + clobber - clobber
            "#
        ),
        8
    );
}

#[test]
fn test_break_closes_upvalues() {
    assert_eq!(
        run_int(
            r#"
            local saved
            while true do
                local v = 21
                saved = function() return v end
                break
            end
            return saved() * 2
            "#
        ),
        42
    );
}

#[test]
fn test_upvalue_assignment_from_closure() {
    assert_eq!(
        run_int(
            r#"
            local sum = 0
            local function add(x) sum = sum + x end
            add(1) add(2) add(3)
            return sum
            "#
        ),
        6
    );
}

#[test]
fn test_recursion_through_local_function() {
    assert_eq!(
        run_int(
            r#"
            local function fib(n)
                if n < 2 then return n end
                return fib(n - 1) + fib(n - 2)
            end
            return fib(15)
            "#
        ),
        610
    );
}

#[test]
fn test_closure_over_parameter() {
    assert_eq!(
        run_int(
            r#"
            local function adder(n) return function(x) return x + n end end
            local add3 = adder(3)
            local add7 = adder(7)
            return add3(10) + add7(10)
            "#
        ),
        30
    );
}

#[test]
fn test_repeat_until_sees_block_locals() {
    // The until condition runs inside the loop body's scope.
    assert_eq!(
        run_int(
            r#"
            local n = 0
            repeat
                local done = n >= 3
                n = n + 1
            until done
            return n
            "#
        ),
        4
    );
}

#[test]
fn test_repeat_with_captured_local() {
    let values = run(
        r#"
        local fns = {}
        local i = 0
        repeat
            local v = i
            fns[#fns + 1] = function() return v end
            i = i + 1
        until i == 3
        return fns[1](), fns[2](), fns[3]()
        "#,
    );
    assert_eq!(crate::test::as_int(&values[0]), 0);
    assert_eq!(crate::test::as_int(&values[1]), 1);
    assert_eq!(crate::test::as_int(&values[2]), 2);
}
