use crate::lua_value::Value;
use crate::lua_vm::{LuaVM, VmOptions};
use crate::test::{run_bool, run_int, run_string};

#[test]
fn test_short_strings_are_interned() {
    // Equal bytes built differently end up pointer-equal.
    assert!(run_bool("local a = 'hi' local b = 'h' .. 'i' return rawequal(a, b)"));
}

#[test]
fn test_intern_threshold_is_exact() {
    let mut vm = LuaVM::new(VmOptions::default());
    let at_limit = "x".repeat(40);
    let over_limit = "x".repeat(41);
    let a = vm.intern(&at_limit);
    let b = vm.intern(&at_limit);
    assert_eq!(a, b, "strings at the limit are interned");
    let c = vm.intern(&over_limit);
    let d = vm.intern(&over_limit);
    assert_ne!(c, d, "strings over the limit are separate objects");
    // Content equality still holds across distinct long strings.
    assert!(Value::Str(c).raw_equal(&Value::Str(d), &vm.pool));
}

#[test]
fn test_long_string_hash_is_lazy() {
    let mut vm = LuaVM::new(VmOptions::default());
    let long = "y".repeat(64);
    let id = vm.intern(&long);
    assert!(vm.pool.string(id).cached_hash().is_none());
    // Using it as a table key forces the hash.
    let t = vm.new_table(0, 4);
    vm.raw_set(t, Value::Str(id), Value::Int(1)).unwrap();
    assert!(vm.pool.string(id).cached_hash().is_some());
}

#[test]
fn test_long_strings_as_table_keys_compare_by_content() {
    assert_eq!(
        run_int(
            r#"
            local k1 = 'zz' .. 'zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz'
            local k2 = 'zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz'
            local t = {}
            t[k1] = 7
            return t[k2]
            "#
        ),
        7
    );
}

#[test]
fn test_concat_chains() {
    assert_eq!(run_string("return 'a' .. 'b' .. 'c' .. 'd'"), "abcd");
    assert_eq!(run_string("return 1 .. 2 .. 3"), "123");
    // Right associativity with a metamethod-free chain collapses once.
    assert_eq!(
        run_string("local parts = '' for i = 1, 4 do parts = parts .. i end return parts"),
        "1234"
    );
}

#[test]
fn test_length_operator() {
    assert_eq!(run_int("return #'hello'"), 5);
    assert_eq!(run_int("return #''"), 0);
}

#[test]
fn test_escape_sequences() {
    assert_eq!(run_int("return #'\\n\\t\\\\'"), 3);
    assert_eq!(run_string("return '\\65\\66\\67'"), "ABC");
    assert_eq!(run_string("return '\\x41\\x42'"), "AB");
    assert_eq!(run_string("return '\\u{48}\\u{49}'"), "HI");
    // \z skips following whitespace including newlines.
    assert_eq!(run_string("return 'a\\z\n   b'"), "ab");
}

#[test]
fn test_long_bracket_strings() {
    assert_eq!(run_string("return [[verbatim \\n]]"), "verbatim \\n");
    assert_eq!(run_string("return [==[nested ]] ok]==]"), "nested ]] ok");
    // A newline right after the opening bracket is dropped.
    assert_eq!(run_string("return [[\nline]]"), "line");
}

#[test]
fn test_string_comparison() {
    assert!(run_bool("return 'abc' < 'abd'"));
    assert!(run_bool("return 'ab' < 'abc'"));
    assert!(run_bool("return 'a' <= 'a'"));
    assert!(!run_bool("return 'b' < 'a'"));
}

#[test]
fn test_number_to_string_formats() {
    assert_eq!(run_string("return tostring(7)"), "7");
    assert_eq!(run_string("return tostring(-3)"), "-3");
    assert_eq!(run_string("return tostring(2.0)"), "2.0");
    assert_eq!(run_string("return tostring(0.25)"), "0.25");
}
