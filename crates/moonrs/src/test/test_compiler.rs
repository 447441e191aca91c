use crate::compiler::{compile, SliceReader};
use crate::lua_value::{Proto, Value};
use crate::lua_vm::{Instruction, LuaVM, OpCode, VmOptions};
use crate::test::{run_err, run_int};

fn compile_src(src: &str) -> Proto {
    let mut vm = LuaVM::new(VmOptions::default());
    compile(
        &mut vm,
        Box::new(SliceReader::new(src.as_bytes())),
        "=test",
    )
    .expect("compile")
}

fn opcodes(p: &Proto) -> Vec<OpCode> {
    p.code.iter().map(|&i| Instruction::opcode(i)).collect()
}

#[test]
fn test_chunk_is_vararg_with_env_upvalue() {
    let p = compile_src("return");
    assert!(p.is_vararg);
    assert_eq!(p.upvalues.len(), 1);
    assert!(p.upvalues[0].in_stack);
}

#[test]
fn test_constant_deduplication() {
    let p = compile_src("local a = 'k' local b = 'k' local c = 'k' return a, b, c");
    let strings = p
        .constants
        .iter()
        .filter(|k| matches!(k, Value::Str(_)))
        .count();
    assert_eq!(strings, 1, "identical string constants share one slot");
    // Integer and float constants of equal value stay distinct.
    let p = compile_src("local a = 1 local b = 1.0 return a + 0, b + 0");
    let ints = p
        .constants
        .iter()
        .filter(|k| matches!(k, Value::Int(_)))
        .count();
    let floats = p
        .constants
        .iter()
        .filter(|k| matches!(k, Value::Float(_)))
        .count();
    assert!(ints >= 1 && floats >= 1);
}

#[test]
fn test_constant_folding() {
    // 2 * 3 + 1 folds into one LOADK of 7.
    let p = compile_src("return 2 * 3 + 1");
    let ops = opcodes(&p);
    assert!(ops.contains(&OpCode::LoadK));
    assert!(!ops.contains(&OpCode::Add), "folded: {:?}", ops);
    assert!(!ops.contains(&OpCode::Mul), "folded: {:?}", ops);
    assert!(p.constants.iter().any(|k| matches!(k, Value::Int(7))));
    // Division by zero is left for runtime.
    let p = compile_src("return 1 // 0");
    assert!(opcodes(&p).contains(&OpCode::IDiv));
}

#[test]
fn test_local_uses_registers_not_constants_table_lookup() {
    let p = compile_src("local x = 5 return x");
    let ops = opcodes(&p);
    assert!(!ops.contains(&OpCode::GetTabUp), "locals never read _ENV");
}

#[test]
fn test_global_reads_through_env() {
    let p = compile_src("return some_global");
    let ops = opcodes(&p);
    assert!(ops.contains(&OpCode::GetTabUp));
}

#[test]
fn test_loadnil_merging() {
    let p = compile_src("local a, b, c return a");
    let nils = opcodes(&p)
        .iter()
        .filter(|o| **o == OpCode::LoadNil)
        .count();
    assert_eq!(nils, 1, "adjacent nil loads merge into one instruction");
}

#[test]
fn test_tail_call_emitted() {
    let p = compile_src("local function f() end return f()");
    let main_ops = opcodes(&p);
    assert!(main_ops.contains(&OpCode::TailCall), "ops: {:?}", main_ops);
    // Not a tail position: plain CALL.
    let p = compile_src("local function f() end local x = f() return x");
    assert!(!opcodes(&p).contains(&OpCode::TailCall));
}

#[test]
fn test_nested_prototypes() {
    let p = compile_src(
        r#"
        local function outer()
            local function inner() return 1 end
            return inner
        end
        return outer
        "#,
    );
    assert_eq!(p.protos.len(), 1);
    assert_eq!(p.protos[0].protos.len(), 1);
}

#[test]
fn test_upvalue_descriptors() {
    let p = compile_src(
        r#"
        local x = 1
        local function f() return x end
        return f
        "#,
    );
    let inner = &p.protos[0];
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].in_stack, "captured from a parent local");
    // Capturing through two levels goes through the middle function's
    // upvalue table.
    let p = compile_src(
        r#"
        local x = 1
        local function mid()
            local function deep() return x end
            return deep
        end
        return mid
        "#,
    );
    let deep = &p.protos[0].protos[0];
    assert_eq!(deep.upvalues.len(), 1);
    assert!(!deep.upvalues[0].in_stack, "captured from an upvalue");
}

#[test]
fn test_numeric_for_reserves_control_registers() {
    let p = compile_src("for i = 1, 10 do end");
    let ops = opcodes(&p);
    assert!(ops.contains(&OpCode::ForPrep));
    assert!(ops.contains(&OpCode::ForLoop));
    // Three hidden + one visible variable appear in the debug table.
    assert!(p.locvars.len() >= 4);
}

#[test]
fn test_generic_for_shape() {
    let p = compile_src("for k, v in pairs({}) do end");
    let ops = opcodes(&p);
    assert!(ops.contains(&OpCode::TForCall));
    assert!(ops.contains(&OpCode::TForLoop));
}

#[test]
fn test_close_emitted_for_captured_block_local() {
    let p = compile_src(
        r#"
        local f
        do
            local v = 1
            f = function() return v end
        end
        return f
        "#,
    );
    assert!(opcodes(&p).contains(&OpCode::Close));
}

#[test]
fn test_lineinfo_tracks_statements() {
    let p = compile_src("local a = 1\nlocal b = 2\nreturn a + b");
    assert_eq!(p.code.len(), p.lineinfo.len());
    assert!(p.lineinfo.contains(&1));
    assert!(p.lineinfo.contains(&2));
    assert!(p.lineinfo.contains(&3));
}

#[test]
fn test_setlist_batching() {
    // A constructor bigger than one flush batch emits several SETLISTs.
    let items: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
    let src = format!("local t = {{{}}} return #t", items.join(","));
    assert_eq!(run_int(&src), 120);
    let p = compile_src(&src);
    let setlists = opcodes(&p)
        .iter()
        .filter(|o| **o == OpCode::SetList)
        .count();
    assert!(setlists >= 2, "expected batched SETLIST, got {}", setlists);
}

#[test]
fn test_newtable_presizing() {
    let p = compile_src("local t = {1, 2, 3} return t");
    let newtable = p
        .code
        .iter()
        .find(|&&i| Instruction::opcode(i) == OpCode::NewTable)
        .copied()
        .expect("NEWTABLE");
    assert!(Instruction::fb_to_int(Instruction::b(newtable)) >= 3);
}

#[test]
fn test_syntax_errors() {
    assert!(run_err("local 1 = 2").contains("expected"));
    assert!(run_err("if true do end").contains("expected"));
    assert!(run_err("return (1").contains("expected"));
    assert!(run_err("end").contains("near"));
}

#[test]
fn test_label_redefinition_error() {
    let msg = run_err("::a:: ::a::");
    assert!(msg.contains("already defined"), "message: {}", msg);
}

#[test]
fn test_deep_nesting_limit() {
    let deep = "(".repeat(300) + "1" + &")".repeat(300);
    let msg = run_err(&format!("return {}", deep));
    assert!(
        msg.contains("too many") || msg.contains("levels"),
        "message: {}",
        msg
    );
}

#[test]
fn test_short_circuit_does_not_evaluate_rhs() {
    assert_eq!(
        run_int(
            r#"
            local calls = 0
            local function bump() calls = calls + 1 return true end
            local _ = false and bump()
            local _ = true or bump()
            return calls
            "#
        ),
        0
    );
}
