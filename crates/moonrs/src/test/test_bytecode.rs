use crate::compiler::SliceReader;
use crate::lua_value::Value;
use crate::lua_vm::{LoadMode, LuaVM, VmOptions};
use crate::test::as_int;

fn fresh_vm() -> Box<LuaVM> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    vm
}

#[test]
fn test_dump_load_round_trip() {
    let mut vm = fresh_vm();
    let f = vm
        .load_str("local a, b = ... return (a or 3) * (b or 4)", "=chunk")
        .unwrap();
    let bytes = vm.dump(f).unwrap();
    assert_eq!(&bytes[..4], b"\x1bLua");

    let g = vm
        .load(Box::new(SliceReader::new(&bytes)), "=reloaded", LoadMode::Binary)
        .unwrap();
    let direct = vm.call_function(f, &[]).unwrap();
    let reloaded = vm.call_function(g, &[]).unwrap();
    assert_eq!(as_int(&direct[0]), 12);
    assert_eq!(as_int(&reloaded[0]), 12);
    // And with arguments.
    let r = vm
        .call_function(g, &[Value::Int(5), Value::Int(6)])
        .unwrap();
    assert_eq!(as_int(&r[0]), 30);
}

#[test]
fn test_round_trip_preserves_nested_functions() {
    let mut vm = fresh_vm();
    let src = r#"
        local function adder(n)
            return function(x) return x + n end
        end
        return adder(10)(32)
    "#;
    let f = vm.load_str(src, "=nested").unwrap();
    let bytes = vm.dump(f).unwrap();
    let g = vm
        .load(Box::new(SliceReader::new(&bytes)), "=nested2", LoadMode::Both)
        .unwrap();
    let r = vm.call_function(g, &[]).unwrap();
    assert_eq!(as_int(&r[0]), 42);
}

#[test]
fn test_round_trip_preserves_constant_subtypes() {
    let mut vm = fresh_vm();
    let f = vm
        .load_str("return 1, 1.0, 'text', true, nil", "=consts")
        .unwrap();
    let bytes = vm.dump(f).unwrap();
    let g = vm
        .load(Box::new(SliceReader::new(&bytes)), "=consts2", LoadMode::Binary)
        .unwrap();
    let r = vm.call_function(g, &[]).unwrap();
    assert!(matches!(r[0], Value::Int(1)));
    assert!(matches!(r[1], Value::Float(f) if f == 1.0));
    assert!(matches!(r[2], Value::Str(_)));
    assert!(matches!(r[3], Value::Bool(true)));
    assert!(r[4].is_nil());
}

#[test]
fn test_mode_gating() {
    let mut vm = fresh_vm();
    let f = vm.load_str("return 1", "=x").unwrap();
    let bytes = vm.dump(f).unwrap();
    // Binary chunk refused in text mode.
    assert!(vm
        .load(Box::new(SliceReader::new(&bytes)), "=y", LoadMode::Text)
        .is_err());
    // Text chunk refused in binary mode.
    assert!(vm
        .load(
            Box::new(SliceReader::new(b"return 1".as_slice())),
            "=z",
            LoadMode::Binary
        )
        .is_err());
}

#[test]
fn test_load_from_chunked_reader() {
    let mut vm = fresh_vm();
    // The reader callback hands out the source in small pieces.
    let pieces = vec![
        b"return ".to_vec(),
        b"10 + ".to_vec(),
        b"32".to_vec(),
    ];
    let mut iter = pieces.into_iter();
    let reader = move || iter.next();
    let f = vm
        .load(Box::new(reader), "=chunked", LoadMode::Text)
        .unwrap();
    let r = vm.call_function(f, &[]).unwrap();
    assert_eq!(as_int(&r[0]), 42);
}

#[test]
fn test_lua_level_load() {
    let values = crate::test::run(
        r#"
        local f = load('return 2 + 3')
        return f()
        "#,
    );
    assert_eq!(as_int(&values[0]), 5);
    // Syntax errors surface as nil + message.
    let values = crate::test::run(
        r#"
        local f, err = load('return +')
        return f == nil, err ~= nil
        "#,
    );
    assert!(crate::test::as_bool(&values[0]));
    assert!(crate::test::as_bool(&values[1]));
}

#[test]
fn test_corrupt_chunk_rejected() {
    let mut vm = fresh_vm();
    let f = vm.load_str("return 1", "=x").unwrap();
    let mut bytes = vm.dump(f).unwrap();
    let last = bytes.len() - 1;
    bytes.truncate(last);
    assert!(vm
        .load(Box::new(SliceReader::new(&bytes)), "=bad", LoadMode::Binary)
        .is_err());
}
