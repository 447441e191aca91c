use crate::test::{as_bool, as_int, run, run_bool, run_int, run_string};

#[test]
fn test_resume_yield_round_trip() {
    // resume passes values into yield; yield passes values out.
    let values = run(
        r#"
        local co = coroutine.create(function(a)
            local b = coroutine.yield(a + 1)
            return b * 2
        end)
        local ok1, v1 = coroutine.resume(co, 10)
        local ok2, v2 = coroutine.resume(co, 5)
        return ok1, v1, ok2, v2
        "#,
    );
    assert!(as_bool(&values[0]));
    assert_eq!(as_int(&values[1]), 11);
    assert!(as_bool(&values[2]));
    assert_eq!(as_int(&values[3]), 10);
}

#[test]
fn test_yield_multiple_values() {
    let values = run(
        r#"
        local co = coroutine.create(function()
            coroutine.yield(1, 2, 3)
            return 'done'
        end)
        local _, a, b, c = coroutine.resume(co)
        local _, d = coroutine.resume(co)
        return a + b + c, d
        "#,
    );
    assert_eq!(as_int(&values[0]), 6);
}

#[test]
fn test_status_lifecycle() {
    assert_eq!(
        run_string(
            r#"
            local co = coroutine.create(function() coroutine.yield() end)
            local s1 = coroutine.status(co)
            coroutine.resume(co)
            local s2 = coroutine.status(co)
            coroutine.resume(co)
            local s3 = coroutine.status(co)
            return s1 .. '/' .. s2 .. '/' .. s3
            "#
        ),
        "suspended/suspended/dead"
    );
}

#[test]
fn test_resume_dead_coroutine_fails() {
    let values = run(
        r#"
        local co = coroutine.create(function() return 1 end)
        coroutine.resume(co)
        local ok, err = coroutine.resume(co)
        return ok, err
        "#,
    );
    assert!(!as_bool(&values[0]));
}

#[test]
fn test_error_in_coroutine_kills_it() {
    let values = run(
        r#"
        local co = coroutine.create(function() error('boom') end)
        local ok, err = coroutine.resume(co)
        return ok, err, coroutine.status(co)
        "#,
    );
    assert!(!as_bool(&values[0]));
    assert_eq!(
        crate::test::run_string(
            r#"
            local co = coroutine.create(function() error('boom') end)
            local ok, err = coroutine.resume(co)
            return coroutine.status(co)
            "#
        ),
        "dead"
    );
}

#[test]
fn test_yield_from_main_is_error() {
    let msg = crate::test::run_err("coroutine.yield()");
    assert!(msg.contains("outside a coroutine"), "message: {}", msg);
}

#[test]
fn test_wrap() {
    assert_eq!(
        run_int(
            r#"
            local gen = coroutine.wrap(function()
                for i = 1, 3 do coroutine.yield(i) end
            end)
            return gen() + gen() * 10 + gen() * 100
            "#
        ),
        321
    );
}

#[test]
fn test_wrap_reraises_errors() {
    let msg = crate::test::run_err(
        r#"
        local f = coroutine.wrap(function() error('inner') end)
        f()
        "#,
    );
    assert!(msg.contains("inner"), "message: {}", msg);
}

#[test]
fn test_isyieldable() {
    assert!(!run_bool("return coroutine.isyieldable()"));
    assert!(run_bool(
        r#"
        local co = coroutine.create(function() coroutine.yield(coroutine.isyieldable()) end)
        local _, inside = coroutine.resume(co)
        return inside
        "#
    ));
}

#[test]
fn test_running() {
    let values = run("return select(2, coroutine.running())");
    assert!(as_bool(&values[0]), "main thread reports is_main = true");
}

#[test]
fn test_coroutines_share_globals() {
    assert_eq!(
        run_int(
            r#"
            shared = 0
            local co = coroutine.create(function()
                shared = shared + 10
                coroutine.yield()
                shared = shared + 100
            end)
            coroutine.resume(co)
            shared = shared + 1
            coroutine.resume(co)
            return shared
            "#
        ),
        111
    );
}

#[test]
fn test_nested_coroutines() {
    assert_eq!(
        run_int(
            r#"
            local inner = coroutine.create(function()
                coroutine.yield(1)
                coroutine.yield(2)
            end)
            local outer = coroutine.create(function()
                local _, a = coroutine.resume(inner)
                coroutine.yield(a)
                local _, b = coroutine.resume(inner)
                coroutine.yield(b)
            end)
            local _, x = coroutine.resume(outer)
            local _, y = coroutine.resume(outer)
            return x * 10 + y
            "#
        ),
        12
    );
}

#[test]
fn test_yield_inside_pcall_resumes_into_pcall() {
    // The pcall frame is a recoverable point across the yield: the body
    // continues inside the pcall and its normal return is wrapped.
    let values = run(
        r#"
        local co = coroutine.create(function()
            local ok, v = pcall(function()
                local got = coroutine.yield('pausing')
                return got + 1
            end)
            return ok, v
        end)
        local _, first = coroutine.resume(co)
        local _, ok, v = coroutine.resume(co, 41)
        return first, ok, v
        "#,
    );
    assert_eq!(crate::test::run_string(
        r#"
        local co = coroutine.create(function()
            local ok, v = pcall(function()
                local got = coroutine.yield('pausing')
                return got + 1
            end)
            return tostring(ok) .. '/' .. tostring(v)
        end)
        coroutine.resume(co)
        local _, r = coroutine.resume(co, 41)
        return r
        "#
    ), "true/42");
    assert!(values.len() >= 3);
}

#[test]
fn test_error_after_yield_still_caught_by_pcall() {
    assert_eq!(
        run_string(
            r#"
            local co = coroutine.create(function()
                local ok, err = pcall(function()
                    coroutine.yield()
                    error('late failure')
                end)
                return (ok and 'caught-nothing') or ('caught:' .. tostring(err ~= nil))
            end)
            coroutine.resume(co)
            local _, r = coroutine.resume(co)
            return r
            "#
        ),
        "caught:true"
    );
}
