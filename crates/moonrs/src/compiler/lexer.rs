// Streaming lexer. Input arrives through a ChunkReader callback and is
// consumed byte by byte with one byte of context (`current`) and one token
// of lookahead. Short string and name tokens are interned as they are
// scanned.

use crate::compiler::parse_number::str_to_number;
use crate::compiler::token::Token;
use crate::lua_value::Value;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Byte-stream source for `load`: each call returns the next block, or
/// None at end of stream.
pub trait ChunkReader {
    fn read_chunk(&mut self) -> Option<Vec<u8>>;
}

/// Reader over an in-memory slice, delivered in one block.
pub struct SliceReader<'a> {
    data: Option<&'a [u8]>,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceReader { data: Some(data) }
    }
}

impl<'a> ChunkReader for SliceReader<'a> {
    fn read_chunk(&mut self) -> Option<Vec<u8>> {
        self.data.take().map(|d| d.to_vec())
    }
}

impl<F> ChunkReader for F
where
    F: FnMut() -> Option<Vec<u8>>,
{
    fn read_chunk(&mut self) -> Option<Vec<u8>> {
        self()
    }
}

const EOZ: i32 = -1;
/// Line count past which something is wrong with the input.
const MAX_LINES: u32 = i32::MAX as u32 - 2;

pub struct Lexer<'a> {
    reader: Box<dyn ChunkReader + 'a>,
    chunk: Vec<u8>,
    chunk_pos: usize,
    /// Current byte, or EOZ.
    current: i32,
    /// Accumulator for the token text being scanned.
    buff: Vec<u8>,
    pub chunkname: String,
    /// Line of the token being scanned.
    pub line: u32,
    /// Line of the last consumed token.
    pub lastline: u32,
    pub token: Token,
    lookahead: Option<(Token, u32)>,
}

impl<'a> Lexer<'a> {
    pub fn new(reader: Box<dyn ChunkReader + 'a>, chunkname: &str) -> Self {
        let mut lex = Lexer {
            reader,
            chunk: Vec::new(),
            chunk_pos: 0,
            current: EOZ,
            buff: Vec::with_capacity(32),
            chunkname: chunkname.to_string(),
            line: 1,
            lastline: 1,
            token: Token::Eos,
            lookahead: None,
        };
        lex.advance();
        lex
    }

    /// First block, used by `load` to sniff the binary-chunk signature.
    pub fn peek_byte(&self) -> Option<u8> {
        if self.current == EOZ {
            None
        } else {
            Some(self.current as u8)
        }
    }

    /// Drain the remaining raw input (binary chunk path).
    pub fn take_rest(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.current != EOZ {
            out.push(self.current as u8);
            self.advance();
        }
        out
    }

    fn advance(&mut self) {
        loop {
            if self.chunk_pos < self.chunk.len() {
                self.current = self.chunk[self.chunk_pos] as i32;
                self.chunk_pos += 1;
                return;
            }
            match self.reader.read_chunk() {
                Some(block) if block.is_empty() => continue,
                Some(block) => {
                    self.chunk = block;
                    self.chunk_pos = 0;
                }
                None => {
                    self.current = EOZ;
                    return;
                }
            }
        }
    }

    #[inline]
    fn save_and_advance(&mut self) {
        self.buff.push(self.current as u8);
        self.advance();
    }

    #[inline]
    fn check_next(&mut self, c: u8) -> bool {
        if self.current == c as i32 {
            self.advance();
            true
        } else {
            false
        }
    }

    fn is_newline(&self) -> bool {
        self.current == b'\n' as i32 || self.current == b'\r' as i32
    }

    /// Consume one line break; \n, \r, \r\n and \n\r each count once.
    fn inc_line(&mut self, vm: &mut LuaVM) -> LuaResult<()> {
        let old = self.current;
        debug_assert!(self.is_newline());
        self.advance();
        if self.is_newline() && self.current != old {
            self.advance();
        }
        self.line += 1;
        if self.line >= MAX_LINES {
            return Err(self.error(vm, "chunk has too many lines"));
        }
        Ok(())
    }

    // ===== Errors =====

    pub fn error(&self, vm: &mut LuaVM, msg: &str) -> LuaError {
        let full = format!("{}:{}: {}", self.chunkname, self.line, msg);
        vm.set_error_string(&full);
        LuaError::SyntaxError
    }

    pub fn error_near(&self, vm: &mut LuaVM, msg: &str) -> LuaError {
        let near = self.token_text(vm, &self.token);
        let full = format!(
            "{}:{}: {} near {}",
            self.chunkname, self.line, msg, near
        );
        vm.set_error_string(&full);
        LuaError::SyntaxError
    }

    pub fn token_text(&self, vm: &LuaVM, t: &Token) -> String {
        match t {
            Token::Name(id) | Token::Str(id) => {
                format!("'{}'", vm.pool.string_display(*id))
            }
            Token::Int(i) => format!("'{}'", i),
            Token::Flt(f) => format!("'{}'", f),
            _ => format!("'{}'", t.fixed_text().unwrap_or("?")),
        }
    }

    // ===== Driving =====

    /// Consume the current token and scan the next.
    pub fn next_token(&mut self, vm: &mut LuaVM) -> LuaResult<()> {
        self.lastline = self.line;
        if let Some((tok, line)) = self.lookahead.take() {
            self.token = tok;
            self.line = line;
            return Ok(());
        }
        self.token = self.scan(vm)?;
        Ok(())
    }

    /// Peek one token ahead without consuming.
    pub fn lookahead(&mut self, vm: &mut LuaVM) -> LuaResult<Token> {
        if let Some((tok, _)) = self.lookahead {
            return Ok(tok);
        }
        let saved_line = self.line;
        let tok = self.scan(vm)?;
        let tok_line = self.line;
        self.lookahead = Some((tok, tok_line));
        self.line = saved_line;
        Ok(tok)
    }

    // ===== Scanning =====

    fn scan(&mut self, vm: &mut LuaVM) -> LuaResult<Token> {
        self.buff.clear();
        loop {
            match self.current {
                EOZ => return Ok(Token::Eos),
                c if c == b'\n' as i32 || c == b'\r' as i32 => {
                    self.inc_line(vm)?;
                }
                c if c == b' ' as i32 || c == b'\t' as i32
                    || c == 0x0b || c == 0x0c =>
                {
                    self.advance();
                }
                c if c == b'-' as i32 => {
                    self.advance();
                    if self.current != b'-' as i32 {
                        return Ok(Token::Minus);
                    }
                    // A comment; long form if a level-matched bracket opens.
                    self.advance();
                    if self.current == b'[' as i32 {
                        let sep = self.skip_sep();
                        self.buff.clear();
                        if sep >= 0 {
                            self.read_long_string(vm, sep, false)?;
                            self.buff.clear();
                            continue;
                        }
                    }
                    while !self.is_newline() && self.current != EOZ {
                        self.advance();
                    }
                }
                c if c == b'[' as i32 => {
                    let sep = self.skip_sep();
                    if sep >= 0 {
                        let s = self.read_long_string(vm, sep, true)?;
                        return Ok(Token::Str(s));
                    }
                    if sep != -1 {
                        return Err(self.error(vm, "invalid long string delimiter"));
                    }
                    return Ok(Token::LBracket);
                }
                c if c == b'=' as i32 => {
                    self.advance();
                    if self.check_next(b'=') {
                        return Ok(Token::Eq);
                    }
                    return Ok(Token::Assign);
                }
                c if c == b'<' as i32 => {
                    self.advance();
                    if self.check_next(b'=') {
                        return Ok(Token::Le);
                    }
                    if self.check_next(b'<') {
                        return Ok(Token::Shl);
                    }
                    return Ok(Token::Lt);
                }
                c if c == b'>' as i32 => {
                    self.advance();
                    if self.check_next(b'=') {
                        return Ok(Token::Ge);
                    }
                    if self.check_next(b'>') {
                        return Ok(Token::Shr);
                    }
                    return Ok(Token::Gt);
                }
                c if c == b'/' as i32 => {
                    self.advance();
                    if self.check_next(b'/') {
                        return Ok(Token::IDiv);
                    }
                    return Ok(Token::Slash);
                }
                c if c == b'~' as i32 => {
                    self.advance();
                    if self.check_next(b'=') {
                        return Ok(Token::Ne);
                    }
                    return Ok(Token::Tilde);
                }
                c if c == b':' as i32 => {
                    self.advance();
                    if self.check_next(b':') {
                        return Ok(Token::DbColon);
                    }
                    return Ok(Token::Colon);
                }
                c if c == b'"' as i32 || c == b'\'' as i32 => {
                    return self.read_string(vm, c as u8).map(Token::Str);
                }
                c if c == b'.' as i32 => {
                    // '.', '..', '...' or a numeral like '.5'.
                    self.save_and_advance();
                    if self.check_next(b'.') {
                        if self.check_next(b'.') {
                            return Ok(Token::Dots);
                        }
                        return Ok(Token::Concat);
                    }
                    if !(self.current >= b'0' as i32 && self.current <= b'9' as i32) {
                        return Ok(Token::Dot);
                    }
                    return self.read_numeral(vm);
                }
                c if (b'0' as i32..=b'9' as i32).contains(&c) => {
                    return self.read_numeral(vm);
                }
                c if c == b'_' as i32
                    || (c >= b'a' as i32 && c <= b'z' as i32)
                    || (c >= b'A' as i32 && c <= b'Z' as i32) =>
                {
                    while self.current == b'_' as i32
                        || (self.current >= b'0' as i32 && self.current <= b'9' as i32)
                        || (self.current >= b'a' as i32 && self.current <= b'z' as i32)
                        || (self.current >= b'A' as i32 && self.current <= b'Z' as i32)
                    {
                        self.save_and_advance();
                    }
                    let name = std::str::from_utf8(&self.buff)
                        .expect("identifier bytes are ASCII");
                    if let Some(kw) = Token::keyword(name) {
                        return Ok(kw);
                    }
                    let id = vm.intern(name);
                    return Ok(Token::Name(id));
                }
                _ => {
                    let single = match self.current as u8 {
                        b'+' => Token::Plus,
                        b'*' => Token::Star,
                        b'%' => Token::Percent,
                        b'^' => Token::Caret,
                        b'#' => Token::Hash,
                        b'&' => Token::Amp,
                        b'|' => Token::Pipe,
                        b'(' => Token::LParen,
                        b')' => Token::RParen,
                        b'{' => Token::LBrace,
                        b'}' => Token::RBrace,
                        b']' => Token::RBracket,
                        b';' => Token::Semi,
                        b',' => Token::Comma,
                        other => {
                            let msg = format!("unexpected symbol near '{}'", other as char);
                            return Err(self.error(vm, &msg));
                        }
                    };
                    self.advance();
                    return Ok(single);
                }
            }
        }
    }

    /// Count the '=' run of a long bracket. Returns the level (>= 0) when
    /// a complete opening was consumed, -1 for a plain '[', and a more
    /// negative count when '=' were seen but no second '['.
    fn skip_sep(&mut self) -> i32 {
        debug_assert!(self.current == b'[' as i32);
        self.advance();
        let mut count = 0;
        while self.current == b'=' as i32 {
            self.advance();
            count += 1;
        }
        if self.current == b'[' as i32 {
            self.advance();
            count
        } else {
            -count - 1
        }
    }

    fn read_long_string(
        &mut self,
        vm: &mut LuaVM,
        sep: i32,
        keep: bool,
    ) -> LuaResult<crate::gc::StrId> {
        let start_line = self.line;
        // A newline right after the opening bracket is skipped.
        if self.is_newline() {
            self.inc_line(vm)?;
        }
        loop {
            match self.current {
                EOZ => {
                    let what = if keep { "string" } else { "comment" };
                    let msg = format!(
                        "unfinished long {} (starting at line {})",
                        what, start_line
                    );
                    return Err(self.error(vm, &msg));
                }
                c if c == b']' as i32 => {
                    // Candidate closing bracket: ']' '='*sep ']'.
                    let mut eqs = 0;
                    self.advance();
                    while self.current == b'=' as i32 {
                        self.advance();
                        eqs += 1;
                    }
                    if eqs == sep && self.current == b']' as i32 {
                        self.advance();
                        let id = vm.intern_bytes(&self.buff);
                        return Ok(id);
                    }
                    if keep {
                        self.buff.push(b']');
                        for _ in 0..eqs {
                            self.buff.push(b'=');
                        }
                    }
                }
                c if c == b'\n' as i32 || c == b'\r' as i32 => {
                    if keep {
                        self.buff.push(b'\n');
                    }
                    self.inc_line(vm)?;
                }
                c => {
                    if keep {
                        self.buff.push(c as u8);
                    }
                    self.advance();
                }
            }
        }
    }

    fn read_string(&mut self, vm: &mut LuaVM, quote: u8) -> LuaResult<crate::gc::StrId> {
        self.advance();
        while self.current != quote as i32 {
            match self.current {
                EOZ => return Err(self.error(vm, "unfinished string")),
                c if c == b'\n' as i32 || c == b'\r' as i32 => {
                    return Err(self.error(vm, "unfinished string"));
                }
                c if c == b'\\' as i32 => {
                    self.advance();
                    match self.current {
                        EOZ => return Err(self.error(vm, "unfinished string")),
                        c if c == b'a' as i32 => {
                            self.buff.push(0x07);
                            self.advance();
                        }
                        c if c == b'b' as i32 => {
                            self.buff.push(0x08);
                            self.advance();
                        }
                        c if c == b'f' as i32 => {
                            self.buff.push(0x0c);
                            self.advance();
                        }
                        c if c == b'n' as i32 => {
                            self.buff.push(b'\n');
                            self.advance();
                        }
                        c if c == b'r' as i32 => {
                            self.buff.push(b'\r');
                            self.advance();
                        }
                        c if c == b't' as i32 => {
                            self.buff.push(b'\t');
                            self.advance();
                        }
                        c if c == b'v' as i32 => {
                            self.buff.push(0x0b);
                            self.advance();
                        }
                        c if c == b'\\' as i32 => {
                            self.buff.push(b'\\');
                            self.advance();
                        }
                        c if c == b'"' as i32 => {
                            self.buff.push(b'"');
                            self.advance();
                        }
                        c if c == b'\'' as i32 => {
                            self.buff.push(b'\'');
                            self.advance();
                        }
                        c if c == b'\n' as i32 || c == b'\r' as i32 => {
                            self.inc_line(vm)?;
                            self.buff.push(b'\n');
                        }
                        c if c == b'x' as i32 => {
                            self.advance();
                            let mut v: u32 = 0;
                            for _ in 0..2 {
                                let d = (self.current as u8 as char).to_digit(16);
                                match d {
                                    Some(d) if self.current != EOZ => {
                                        v = v * 16 + d;
                                        self.advance();
                                    }
                                    _ => {
                                        return Err(
                                            self.error(vm, "hexadecimal digit expected")
                                        );
                                    }
                                }
                            }
                            self.buff.push(v as u8);
                        }
                        c if c == b'u' as i32 => {
                            self.advance();
                            if self.current != b'{' as i32 {
                                return Err(self.error(vm, "missing '{' in \\u{xxxx}"));
                            }
                            self.advance();
                            let mut v: u32 = 0;
                            let mut digits = 0;
                            while let Some(d) =
                                (self.current as u8 as char).to_digit(16)
                            {
                                if self.current == EOZ {
                                    break;
                                }
                                v = v.checked_mul(16).and_then(|v| v.checked_add(d))
                                    .ok_or_else(|| {
                                        self.error(vm, "UTF-8 value too large")
                                    })?;
                                digits += 1;
                                self.advance();
                            }
                            if digits == 0 {
                                return Err(self.error(vm, "hexadecimal digit expected"));
                            }
                            if self.current != b'}' as i32 {
                                return Err(self.error(vm, "missing '}' in \\u{xxxx}"));
                            }
                            self.advance();
                            if v > 0x10FFFF {
                                return Err(self.error(vm, "UTF-8 value too large"));
                            }
                            push_utf8(&mut self.buff, v);
                        }
                        c if c == b'z' as i32 => {
                            self.advance();
                            while self.current != EOZ
                                && (self.current as u8).is_ascii_whitespace()
                            {
                                if self.is_newline() {
                                    self.inc_line(vm)?;
                                } else {
                                    self.advance();
                                }
                            }
                        }
                        c if (b'0' as i32..=b'9' as i32).contains(&c) => {
                            let mut v: u32 = 0;
                            let mut i = 0;
                            while i < 3
                                && (b'0' as i32..=b'9' as i32).contains(&self.current)
                            {
                                v = v * 10 + (self.current as u32 - b'0' as u32);
                                self.advance();
                                i += 1;
                            }
                            if v > 255 {
                                return Err(self.error(vm, "decimal escape too large"));
                            }
                            self.buff.push(v as u8);
                        }
                        _ => return Err(self.error(vm, "invalid escape sequence")),
                    }
                }
                c => {
                    self.buff.push(c as u8);
                    self.advance();
                }
            }
        }
        self.advance();
        let id = vm.intern_bytes(&self.buff);
        Ok(id)
    }

    fn read_numeral(&mut self, vm: &mut LuaVM) -> LuaResult<Token> {
        // Collect the maximal numeral-looking run; exponent signs only
        // after their marker. Validation happens in str_to_number.
        let hex = self.current == b'0' as i32 && {
            self.save_and_advance();
            if self.current == b'x' as i32 || self.current == b'X' as i32 {
                self.save_and_advance();
                true
            } else {
                false
            }
        };
        let exp_markers: [u8; 2] = if hex { [b'p', b'P'] } else { [b'e', b'E'] };
        loop {
            let c = self.current;
            if c == EOZ {
                break;
            }
            let b = c as u8;
            if exp_markers.contains(&b) {
                self.save_and_advance();
                if self.current == b'+' as i32 || self.current == b'-' as i32 {
                    self.save_and_advance();
                }
            } else if b.is_ascii_alphanumeric() || b == b'.' {
                self.save_and_advance();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.buff)
            .expect("numeral bytes are ASCII");
        match str_to_number(text) {
            Some(Value::Int(i)) => Ok(Token::Int(i)),
            Some(Value::Float(f)) => Ok(Token::Flt(f)),
            _ => Err(self.error(vm, "malformed number")),
        }
    }
}

fn push_utf8(buf: &mut Vec<u8>, cp: u32) {
    match char::from_u32(cp) {
        Some(c) => {
            let mut tmp = [0u8; 4];
            buf.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
        }
        None => {
            // Surrogate range: encode the raw code point the way the
            // reference does.
            buf.push(0xe0 | (cp >> 12) as u8);
            buf.push(0x80 | ((cp >> 6) & 0x3f) as u8);
            buf.push(0x80 | (cp & 0x3f) as u8);
        }
    }
}
