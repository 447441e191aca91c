use crate::compiler::{Lexer, SliceReader, Token};
use crate::lua_vm::{LuaVM, VmOptions};
use crate::test::{run_err, run_int, run_string};

fn tokens_of(src: &str) -> Vec<Token> {
    let mut vm = LuaVM::new(VmOptions::default());
    let mut lex = Lexer::new(Box::new(SliceReader::new(src.as_bytes())), "=test");
    let mut out = Vec::new();
    loop {
        lex.next_token(&mut vm).expect("lex");
        if lex.token == Token::Eos {
            break;
        }
        out.push(lex.token);
    }
    out
}

#[test]
fn test_keywords_vs_names() {
    let toks = tokens_of("while whilst do doit end");
    assert!(matches!(toks[0], Token::While));
    assert!(matches!(toks[1], Token::Name(_)));
    assert!(matches!(toks[2], Token::Do));
    assert!(matches!(toks[3], Token::Name(_)));
    assert!(matches!(toks[4], Token::End));
}

#[test]
fn test_multichar_punctuation() {
    let toks = tokens_of("== ~= <= >= << >> // .. ... ::");
    assert_eq!(
        toks,
        vec![
            Token::Eq,
            Token::Ne,
            Token::Le,
            Token::Ge,
            Token::Shl,
            Token::Shr,
            Token::IDiv,
            Token::Concat,
            Token::Dots,
            Token::DbColon,
        ]
    );
}

#[test]
fn test_number_classification() {
    let toks = tokens_of("1 1.5 1e2 0x10 0x1p4 .5 3.");
    assert!(matches!(toks[0], Token::Int(1)));
    assert!(matches!(toks[1], Token::Flt(f) if f == 1.5));
    assert!(matches!(toks[2], Token::Flt(f) if f == 100.0));
    assert!(matches!(toks[3], Token::Int(16)));
    assert!(matches!(toks[4], Token::Flt(f) if f == 16.0));
    assert!(matches!(toks[5], Token::Flt(f) if f == 0.5));
    assert!(matches!(toks[6], Token::Flt(f) if f == 3.0));
}

#[test]
fn test_malformed_number_is_error() {
    let msg = run_err("return 0x");
    assert!(msg.contains("malformed number"), "message: {}", msg);
    let msg = run_err("return 1..2");
    assert!(msg.contains("malformed number"), "message: {}", msg);
}

#[test]
fn test_line_counting_all_endings() {
    // \n, \r, \r\n and \n\r all advance exactly one line.
    let mut vm = LuaVM::new(VmOptions::default());
    let src = b"a\nb\rc\r\nd\n\re";
    let mut lex = Lexer::new(Box::new(SliceReader::new(src)), "=lines");
    let mut lines = Vec::new();
    loop {
        lex.next_token(&mut vm).unwrap();
        if lex.token == Token::Eos {
            break;
        }
        lines.push(lex.line);
    }
    assert_eq!(lines, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_comments_are_skipped() {
    assert_eq!(
        run_int(
            "-- a short comment\nlocal x = 1 --[[ a long\ncomment ]] local y = 2\nreturn x + y"
        ),
        3
    );
    assert_eq!(run_int("--[==[ level two ]] still inside ]==] return 9"), 9);
}

#[test]
fn test_unterminated_string_is_error() {
    let msg = run_err("return 'open");
    assert!(msg.contains("unfinished string"), "message: {}", msg);
    let msg = run_err("return [[never closed");
    assert!(msg.contains("unfinished long string"), "message: {}", msg);
    let msg = run_err("--[[ never closed");
    assert!(msg.contains("unfinished long comment"), "message: {}", msg);
}

#[test]
fn test_error_carries_chunk_and_line() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs();
    let r = vm.execute_string("\n\nlocal = 5");
    assert!(r.is_err());
    let msg = vm.error_message();
    assert!(msg.contains(":3"), "expected line 3 in: {}", msg);
}

#[test]
fn test_lookahead_does_not_consume() {
    let mut vm = LuaVM::new(VmOptions::default());
    let mut lex = Lexer::new(Box::new(SliceReader::new(b"a = 1")), "=t");
    lex.next_token(&mut vm).unwrap();
    assert!(matches!(lex.token, Token::Name(_)));
    let peeked = lex.lookahead(&mut vm).unwrap();
    assert!(matches!(peeked, Token::Assign));
    assert!(matches!(lex.token, Token::Name(_)), "current unchanged");
    lex.next_token(&mut vm).unwrap();
    assert!(matches!(lex.token, Token::Assign));
}

#[test]
fn test_decimal_escape_limit() {
    let msg = run_err("return '\\300'");
    assert!(msg.contains("decimal escape too large"), "message: {}", msg);
}

#[test]
fn test_string_tokens_are_interned() {
    let toks = tokens_of("'dup' 'dup'");
    match (&toks[0], &toks[1]) {
        (Token::Str(a), Token::Str(b)) => assert_eq!(a, b),
        other => panic!("expected two strings, got {:?}", other),
    }
}

#[test]
fn test_shebang_like_symbol_errors() {
    // '#' alone is the length operator; at statement level it is a
    // syntax error, not a lexer crash.
    assert!(run_err("# comment").contains("unexpected symbol") || !run_err("# comment").is_empty());
}

#[test]
fn test_adjacent_string_call_sugar() {
    assert_eq!(run_string("local function id(s) return s end return id 'direct'"), "direct");
    assert_eq!(run_int("local function len(t) return #t end return len {1, 2}"), 2);
}
