use crate::test::{as_bool, run, run_err, run_int, run_string};

#[test]
fn test_pcall_catches_error() {
    let values = run("return pcall(function() error('bang') end)");
    assert!(!as_bool(&values[0]));
    // The error object is a string carrying the message.
    assert_eq!(
        run_string(
            "local ok, err = pcall(function() error('bang') end) return type(err)"
        ),
        "string"
    );
    let msg = run_string("local ok, err = pcall(function() error('bang') end) return err");
    assert!(msg.contains("bang"), "message: {}", msg);
}

#[test]
fn test_pcall_success_passes_results() {
    let values = run("return pcall(function() return 1, 2, 3 end)");
    assert!(as_bool(&values[0]));
    assert_eq!(values.len(), 4);
    assert_eq!(crate::test::as_int(&values[3]), 3);
}

#[test]
fn test_pcall_passes_arguments() {
    assert_eq!(
        run_int("local ok, v = pcall(function(a, b) return a + b end, 30, 12) return v"),
        42
    );
}

#[test]
fn test_error_with_position_prefix() {
    let msg = run_string(
        "local ok, err = pcall(function() error('tagged') end) return err",
    );
    assert!(msg.contains("tagged"), "message: {}", msg);
    assert!(msg.contains(':'), "expected position prefix: {}", msg);
}

#[test]
fn test_error_level_zero_no_prefix() {
    assert_eq!(
        run_string(
            "local ok, err = pcall(function() error('clean', 0) end) return err"
        ),
        "clean"
    );
}

#[test]
fn test_error_with_non_string_object() {
    // Any value can be thrown and is delivered untouched.
    assert_eq!(
        run_int(
            r#"
            local ok, err = pcall(function() error({code = 42}) end)
            return err.code
            "#
        ),
        42
    );
}

#[test]
fn test_runtime_error_from_vm_has_position() {
    let msg = run_string(
        "local ok, err = pcall(function() return nil + 1 end) return err",
    );
    assert!(msg.contains("arithmetic"), "message: {}", msg);
}

#[test]
fn test_nested_pcall() {
    assert_eq!(
        run_string(
            r#"
            local ok1, r = pcall(function()
                local ok2, err = pcall(function() error('inner') end)
                if ok2 then return 'inner-not-caught' end
                error('outer')
            end)
            return (ok1 and 'no') or 'outer-caught'
            "#
        ),
        "outer-caught"
    );
}

#[test]
fn test_pcall_restores_stack_depth() {
    assert_eq!(
        run_int(
            r#"
            local function fail() error('x') end
            for _ = 1, 100 do pcall(fail) end
            return 1
            "#
        ),
        1
    );
}

#[test]
fn test_xpcall_handler_rewrites_error() {
    assert_eq!(
        run_string(
            r#"
            local ok, err = xpcall(
                function() error('original') end,
                function(e) return 'handled' end)
            return err
            "#
        ),
        "handled"
    );
}

#[test]
fn test_xpcall_success_path() {
    let values = run("return xpcall(function(a) return a * 2 end, function() end, 21)");
    assert!(as_bool(&values[0]));
    assert_eq!(crate::test::as_int(&values[1]), 42);
}

#[test]
fn test_assert_passthrough_and_failure() {
    let values = run("return assert(1, 'unused', 'extra')");
    assert_eq!(values.len(), 3);
    let msg = run_err("assert(false, 'custom reason')");
    assert!(msg.contains("custom reason"), "message: {}", msg);
    let msg = run_err("assert(nil)");
    assert!(msg.contains("assertion failed"), "message: {}", msg);
}

#[test]
fn test_uncaught_error_reaches_host() {
    let msg = run_err("error('top level')");
    assert!(msg.contains("top level"), "message: {}", msg);
}

#[test]
fn test_calling_non_function_errors() {
    let msg = run_err("local x = 5 x()");
    assert!(msg.contains("call"), "message: {}", msg);
}

#[test]
fn test_syntax_error_reports_line() {
    let mut vm = crate::lua_vm::LuaVM::new(crate::lua_vm::VmOptions::default());
    vm.open_libs();
    let r = vm.execute_string("local a = 1\nlocal b = ]");
    assert!(r.is_err());
    let msg = vm.error_message();
    assert!(msg.contains(":2"), "expected line 2 in: {}", msg);
}

#[test]
fn test_too_many_locals_is_compile_error() {
    let mut src = String::new();
    for i in 0..=200 {
        src.push_str(&format!("local v{} = {}\n", i, i));
    }
    let msg = run_err(&src);
    assert!(msg.contains("local variables"), "message: {}", msg);
}

#[test]
fn test_vararg_outside_vararg_function() {
    let msg = run_err("local function f() return ... end return f()");
    assert!(msg.contains("vararg"), "message: {}", msg);
}

#[test]
fn test_stack_overflow_is_caught_by_pcall() {
    // Non-tail recursion must hit the frame limit, and pcall turns the
    // overflow into a regular failure.
    let values = run(
        r#"
        local function f() return 1 + f() end
        local ok, err = pcall(f)
        return ok, err
        "#,
    );
    assert!(!as_bool(&values[0]));
    let msg = run_string(
        r#"
        local function f() return 1 + f() end
        local ok, err = pcall(f)
        return err
        "#,
    );
    assert!(msg.contains("stack overflow"), "message: {}", msg);
}
