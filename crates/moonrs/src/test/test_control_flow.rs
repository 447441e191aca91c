use crate::test::{run, run_err, run_int, run_string};

#[test]
fn test_if_chain() {
    let src = r#"
        local function grade(n)
            if n >= 90 then return "A"
            elseif n >= 80 then return "B"
            elseif n >= 70 then return "C"
            else return "F" end
        end
        return grade(95) .. grade(85) .. grade(75) .. grade(10)
    "#;
    assert_eq!(run_string(src), "ABCF");
}

#[test]
fn test_while_loop() {
    assert_eq!(
        run_int("local n, s = 0, 0 while n < 10 do n = n + 1 s = s + n end return s"),
        55
    );
    assert_eq!(run_int("while false do end return 1"), 1);
}

#[test]
fn test_repeat_loop() {
    assert_eq!(
        run_int("local n = 0 repeat n = n + 1 until n >= 5 return n"),
        5
    );
    // The body always runs once.
    assert_eq!(run_int("local n = 0 repeat n = n + 1 until true return n"), 1);
}

#[test]
fn test_numeric_for_positive_step() {
    assert_eq!(run_int("local s = 0 for i = 1, 10 do s = s + i end return s"), 55);
    assert_eq!(run_int("local s = 0 for i = 1, 10, 3 do s = s + i end return s"), 1 + 4 + 7 + 10);
}

#[test]
fn test_numeric_for_negative_step() {
    assert_eq!(run_int("local s = 0 for i = 5, 1, -1 do s = s + i end return s"), 15);
    assert_eq!(run_int("local n = 0 for _ = 3, 1 do n = n + 1 end return n"), 0);
}

#[test]
fn test_numeric_for_float() {
    assert_eq!(
        run_int("local n = 0 for _ = 1.0, 2.0, 0.5 do n = n + 1 end return n"),
        3
    );
}

#[test]
fn test_for_step_zero_raises() {
    let msg = run_err("for i = 1, 2, 0 do end");
    assert!(msg.contains("'for' step is zero"), "message: {}", msg);
    // Float steps of zero raise as well.
    let msg = run_err("for i = 1, 2, 0.0 do end");
    assert!(msg.contains("'for' step is zero"), "message: {}", msg);
}

#[test]
fn test_for_loop_edge_at_max_int() {
    // The loop must stop cleanly at the integer limit instead of
    // wrapping around.
    assert_eq!(
        run_int(
            r#"
            local maxi = 0x7fffffffffffffff
            local n = 0
            for i = maxi - 2, maxi do n = n + 1 end
            return n
            "#
        ),
        3
    );
}

#[test]
fn test_generic_for_pairs() {
    assert_eq!(
        run_int(
            r#"
            local t = {a = 1, b = 2, c = 3}
            local sum = 0
            for _, v in pairs(t) do sum = sum + v end
            return sum
            "#
        ),
        6
    );
}

#[test]
fn test_generic_for_ipairs_stops_at_hole() {
    assert_eq!(
        run_int(
            r#"
            local t = {10, 20, nil, 40}
            local sum = 0
            for _, v in ipairs(t) do sum = sum + v end
            return sum
            "#
        ),
        30
    );
}

#[test]
fn test_break() {
    assert_eq!(
        run_int(
            r#"
            local n = 0
            for i = 1, 100 do
                if i > 5 then break end
                n = n + i
            end
            return n
            "#
        ),
        15
    );
}

#[test]
fn test_break_inner_loop_only() {
    assert_eq!(
        run_int(
            r#"
            local count = 0
            for i = 1, 3 do
                for j = 1, 10 do
                    if j == 2 then break end
                    count = count + 1
                end
            end
            return count
            "#
        ),
        3
    );
}

#[test]
fn test_goto_forward_and_label() {
    assert_eq!(
        run_int(
            r#"
            local x = 1
            goto skip
            x = 100
            ::skip::
            return x
            "#
        ),
        1
    );
}

#[test]
fn test_goto_as_continue() {
    assert_eq!(
        run_int(
            r#"
            local sum = 0
            for i = 1, 10 do
                if i % 2 == 0 then goto continue end
                sum = sum + i
                ::continue::
            end
            return sum
            "#
        ),
        25
    );
}

#[test]
fn test_goto_backward() {
    assert_eq!(
        run_int(
            r#"
            local n = 0
            ::again::
            n = n + 1
            if n < 3 then goto again end
            return n
            "#
        ),
        3
    );
}

#[test]
fn test_break_outside_loop_is_error() {
    let msg = run_err("break");
    assert!(msg.contains("break"), "message: {}", msg);
}

#[test]
fn test_goto_undefined_label_is_error() {
    let msg = run_err("goto nowhere");
    assert!(msg.contains("nowhere"), "message: {}", msg);
}

#[test]
fn test_multiple_returns_through_loops() {
    let values = run(
        r#"
        local function firstEven(t)
            for i, v in ipairs(t) do
                if v % 2 == 0 then return i, v end
            end
            return nil
        end
        return firstEven({3, 5, 8, 9})
        "#,
    );
    assert_eq!(crate::test::as_int(&values[0]), 3);
    assert_eq!(crate::test::as_int(&values[1]), 8);
}

#[test]
fn test_nested_function_statements() {
    assert_eq!(
        run_int(
            r#"
            local lib = {}
            function lib.twice(x) return 2 * x end
            lib.sub = { }
            function lib.sub.thrice(x) return 3 * x end
            return lib.twice(2) + lib.sub.thrice(3)
            "#
        ),
        13
    );
}
