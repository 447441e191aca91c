// Expression grammar: primary/suffixed/simple expressions, the
// precedence-climbing operator parser, table constructors, and call
// argument lists.

use crate::compiler::expdesc::{binop_priority, BinOp, ExpDesc, ExpKind, UnOp, UNARY_PRIORITY};
use crate::compiler::token::Token;
use crate::compiler::LuaParser;
use crate::lua_vm::{Instruction, LuaResult, OpCode, LFIELDS_PER_FLUSH};

fn unop_of(t: &Token) -> Option<UnOp> {
    match t {
        Token::Minus => Some(UnOp::Minus),
        Token::Not => Some(UnOp::Not),
        Token::Hash => Some(UnOp::Len),
        Token::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

fn binop_of(t: &Token) -> Option<BinOp> {
    match t {
        Token::Plus => Some(BinOp::Add),
        Token::Minus => Some(BinOp::Sub),
        Token::Star => Some(BinOp::Mul),
        Token::Slash => Some(BinOp::Div),
        Token::IDiv => Some(BinOp::IDiv),
        Token::Percent => Some(BinOp::Mod),
        Token::Caret => Some(BinOp::Pow),
        Token::Concat => Some(BinOp::Concat),
        Token::Amp => Some(BinOp::BAnd),
        Token::Pipe => Some(BinOp::BOr),
        Token::Tilde => Some(BinOp::BXor),
        Token::Shl => Some(BinOp::Shl),
        Token::Shr => Some(BinOp::Shr),
        Token::Ne => Some(BinOp::Ne),
        Token::Eq => Some(BinOp::Eq),
        Token::Lt => Some(BinOp::Lt),
        Token::Le => Some(BinOp::Le),
        Token::Gt => Some(BinOp::Gt),
        Token::Ge => Some(BinOp::Ge),
        Token::And => Some(BinOp::And),
        Token::Or => Some(BinOp::Or),
        _ => None,
    }
}

struct ConsControl {
    /// Last read list item, still undischarged.
    v: ExpDesc,
    /// Register holding the table.
    table_reg: u32,
    /// Total array-part items.
    na: u32,
    /// Hash-part items.
    nh: u32,
    /// List items pending a SETLIST flush.
    tostore: u32,
}

impl<'a> LuaParser<'a> {
    pub fn expr(&mut self) -> LuaResult<ExpDesc> {
        let (e, _) = self.subexpr(0)?;
        Ok(e)
    }

    /// Parse expressions binding tighter than `limit`; returns the first
    /// unconsumed operator.
    fn subexpr(&mut self, limit: u8) -> LuaResult<(ExpDesc, Option<BinOp>)> {
        self.enter_level()?;
        let mut e;
        if let Some(uop) = unop_of(&self.lex.token) {
            let line = self.lex.line;
            self.next_token()?;
            let (inner, _) = self.subexpr(UNARY_PRIORITY)?;
            e = inner;
            self.prefix(uop, &mut e, line)?;
        } else {
            e = self.simple_exp()?;
        }
        let mut op = binop_of(&self.lex.token);
        while let Some(o) = op {
            let (left, right) = binop_priority(o);
            if left <= limit {
                break;
            }
            let line = self.lex.line;
            self.next_token()?;
            self.infix(o, &mut e)?;
            let (mut e2, next_op) = self.subexpr(right)?;
            self.posfix(o, &mut e, &mut e2, line)?;
            op = next_op;
        }
        self.leave_level();
        Ok((e, op))
    }

    fn simple_exp(&mut self) -> LuaResult<ExpDesc> {
        let e = match self.lex.token {
            Token::Int(i) => {
                self.next_token()?;
                ExpDesc::int(i)
            }
            Token::Flt(n) => {
                self.next_token()?;
                ExpDesc::float(n)
            }
            Token::Str(s) => {
                self.next_token()?;
                let k = self.string_k(s)?;
                ExpDesc::with_info(ExpKind::K, k)
            }
            Token::Nil => {
                self.next_token()?;
                ExpDesc::new(ExpKind::Nil)
            }
            Token::True => {
                self.next_token()?;
                ExpDesc::new(ExpKind::True)
            }
            Token::False => {
                self.next_token()?;
                ExpDesc::new(ExpKind::False)
            }
            Token::Dots => {
                if !self.fs().proto.is_vararg {
                    return Err(self
                        .lex
                        .error_near(self.vm, "cannot use '...' outside a vararg function"));
                }
                self.next_token()?;
                let pc = self.emit_abc(OpCode::Vararg, 0, 1, 0);
                ExpDesc::with_info(ExpKind::Vararg, pc as u32)
            }
            Token::LBrace => return self.constructor(),
            Token::Function => {
                let line = self.lex.line;
                self.next_token()?;
                return self.body(false, line);
            }
            _ => return self.suffixed_exp(),
        };
        Ok(e)
    }

    fn primary_exp(&mut self) -> LuaResult<ExpDesc> {
        match self.lex.token {
            Token::LParen => {
                let line = self.lex.line;
                self.next_token()?;
                let mut e = self.expr()?;
                self.check_match(Token::RParen, Token::LParen, line)?;
                // Parentheses truncate multiple results to one.
                self.discharge_vars(&mut e);
                Ok(e)
            }
            Token::Name(id) => {
                self.next_token()?;
                self.single_var(id)
            }
            _ => Err(self.lex.error_near(self.vm, "unexpected symbol")),
        }
    }

    pub fn suffixed_exp(&mut self) -> LuaResult<ExpDesc> {
        let line = self.lex.line;
        let mut e = self.primary_exp()?;
        loop {
            match self.lex.token {
                Token::Dot => {
                    self.next_token()?;
                    let name = self.check_name()?;
                    self.exp_to_any_reg_up(&mut e)?;
                    let k = self.string_k(name)?;
                    let mut key = ExpDesc::with_info(ExpKind::K, k);
                    self.indexed(&mut e, &mut key)?;
                }
                Token::LBracket => {
                    self.next_token()?;
                    self.exp_to_any_reg_up(&mut e)?;
                    let mut key = self.expr()?;
                    self.exp_to_val(&mut key)?;
                    self.check_next(Token::RBracket)?;
                    self.indexed(&mut e, &mut key)?;
                }
                Token::Colon => {
                    self.next_token()?;
                    let name = self.check_name()?;
                    let k = self.string_k(name)?;
                    let mut key = ExpDesc::with_info(ExpKind::K, k);
                    self.emit_self(&mut e, &mut key)?;
                    self.func_args(&mut e, line)?;
                }
                Token::LParen | Token::LBrace | Token::Str(_) => {
                    self.exp_to_next_reg(&mut e)?;
                    self.func_args(&mut e, line)?;
                }
                _ => return Ok(e),
            }
        }
    }

    fn func_args(&mut self, f: &mut ExpDesc, line: u32) -> LuaResult<()> {
        let mut args = match self.lex.token {
            Token::LParen => {
                self.next_token()?;
                if self.lex.token == Token::RParen {
                    let e = ExpDesc::new(ExpKind::Void);
                    self.next_token()?;
                    e
                } else {
                    let (_, mut e) = self.exp_list()?;
                    if e.has_multret() {
                        self.set_returns(&e, -1)?;
                    }
                    self.check_match(Token::RParen, Token::LParen, line)?;
                    e
                }
            }
            Token::LBrace => self.constructor()?,
            Token::Str(s) => {
                self.next_token()?;
                let k = self.string_k(s)?;
                ExpDesc::with_info(ExpKind::K, k)
            }
            _ => {
                return Err(self.lex.error_near(self.vm, "function arguments expected"));
            }
        };
        debug_assert!(f.kind == ExpKind::NonReloc);
        let base = f.info;
        let nparams = if args.has_multret() {
            -1
        } else {
            if args.kind != ExpKind::Void {
                self.exp_to_next_reg(&mut args)?;
            }
            (self.fs().freereg as i32) - (base as i32 + 1)
        };
        f.info = self.emit_abc(OpCode::Call, base, (nparams + 1) as u32, 2) as u32;
        f.kind = ExpKind::Call;
        self.fix_line(line);
        // The call removes the function and arguments; one result stays.
        self.fs_mut().freereg = (base + 1) as u8;
        Ok(())
    }

    /// explist -> expr {',' expr}; returns count and the last expression
    /// undischarged.
    pub fn exp_list(&mut self) -> LuaResult<(i32, ExpDesc)> {
        let mut n = 1;
        let mut e = self.expr()?;
        while self.test_next(Token::Comma)? {
            self.exp_to_next_reg(&mut e)?;
            e = self.expr()?;
            n += 1;
        }
        Ok((n, e))
    }

    // ===== Table constructors =====

    pub fn constructor(&mut self) -> LuaResult<ExpDesc> {
        let line = self.lex.line;
        let pc = self.emit_abc(OpCode::NewTable, 0, 0, 0);
        let mut t = ExpDesc::with_info(ExpKind::Reloc, pc as u32);
        self.exp_to_next_reg(&mut t)?;
        let mut cc = ConsControl {
            v: ExpDesc::new(ExpKind::Void),
            table_reg: t.info,
            na: 0,
            nh: 0,
            tostore: 0,
        };
        self.check_next(Token::LBrace)?;
        loop {
            if self.lex.token == Token::RBrace {
                break;
            }
            self.close_list_field(&mut cc)?;
            match self.lex.token {
                Token::Name(_) => {
                    if self.lex.lookahead(self.vm)? == Token::Assign {
                        self.rec_field(&mut cc)?;
                    } else {
                        self.list_field(&mut cc)?;
                    }
                }
                Token::LBracket => {
                    self.rec_field(&mut cc)?;
                }
                _ => {
                    self.list_field(&mut cc)?;
                }
            }
            if !(self.test_next(Token::Comma)? || self.test_next(Token::Semi)?) {
                break;
            }
        }
        self.check_match(Token::RBrace, Token::LBrace, line)?;
        self.last_list_field(&mut cc)?;
        let fs = self.fs_mut();
        let i = &mut fs.proto.code[pc as usize];
        Instruction::set_b(i, Instruction::int_to_fb(cc.na));
        Instruction::set_c(i, Instruction::int_to_fb(cc.nh));
        Ok(t)
    }

    fn close_list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        if cc.v.kind == ExpKind::Void {
            return Ok(());
        }
        let mut v = cc.v;
        self.exp_to_next_reg(&mut v)?;
        cc.v = ExpDesc::new(ExpKind::Void);
        if cc.tostore == LFIELDS_PER_FLUSH {
            self.emit_setlist(cc.table_reg, cc.na, cc.tostore as i32)?;
            cc.tostore = 0;
        }
        Ok(())
    }

    fn last_list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        if cc.tostore == 0 {
            return Ok(());
        }
        if cc.v.has_multret() {
            self.set_returns(&cc.v, -1)?;
            self.emit_setlist(cc.table_reg, cc.na, -1)?;
            // The multi-value producer fills past na; it is not counted.
            cc.na -= 1;
        } else {
            if cc.v.kind != ExpKind::Void {
                let mut v = cc.v;
                self.exp_to_next_reg(&mut v)?;
                cc.v = v;
            }
            self.emit_setlist(cc.table_reg, cc.na, cc.tostore as i32)?;
        }
        Ok(())
    }

    fn list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        cc.v = self.expr()?;
        if cc.na >= (i32::MAX as u32) - LFIELDS_PER_FLUSH {
            return Err(self.error_limit(i32::MAX as usize, "items in a constructor"));
        }
        cc.na += 1;
        cc.tostore += 1;
        Ok(())
    }

    fn rec_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        let reg = self.fs().freereg;
        let mut key = match self.lex.token {
            Token::Name(id) => {
                self.next_token()?;
                let k = self.string_k(id)?;
                ExpDesc::with_info(ExpKind::K, k)
            }
            _ => {
                // '[' exp ']'
                self.check_next(Token::LBracket)?;
                let mut k = self.expr()?;
                self.exp_to_val(&mut k)?;
                self.check_next(Token::RBracket)?;
                k
            }
        };
        cc.nh += 1;
        self.check_next(Token::Assign)?;
        let mut tab = ExpDesc::with_info(ExpKind::NonReloc, cc.table_reg);
        self.indexed(&mut tab, &mut key)?;
        let mut val = self.expr()?;
        self.store_var(&tab, &mut val)?;
        self.fs_mut().freereg = reg;
        Ok(())
    }

    // ===== Function literals =====

    /// funcbody -> '(' parlist ')' block END. Compiles a nested function
    /// and leaves a CLOSURE-producing expression in the enclosing one.
    pub fn body(&mut self, is_method: bool, line: u32) -> LuaResult<ExpDesc> {
        let source = self.fs().proto.source;
        self.open_func(source, line);
        self.check_next(Token::LParen)?;
        if is_method {
            self.new_localvar_literal("self")?;
            self.adjust_local_vars(1);
        }
        self.par_list()?;
        self.check_next(Token::RParen)?;
        self.stat_list()?;
        let lastline = self.lex.line;
        self.check_match(Token::End, Token::Function, line)?;
        let mut proto = self.close_func()?;
        proto.lastlinedefined = lastline;
        // Bind the new prototype in the enclosing function.
        let fs = self.fs_mut();
        fs.proto.protos.push(std::rc::Rc::new(proto));
        let idx = fs.proto.protos.len() as u32 - 1;
        if idx > Instruction::MAX_BX {
            return Err(self.error_limit(Instruction::MAX_BX as usize, "functions in a chunk"));
        }
        let pc = self.emit_abx(OpCode::Closure, 0, idx);
        let mut e = ExpDesc::with_info(ExpKind::Reloc, pc as u32);
        self.exp_to_next_reg(&mut e)?;
        self.fix_line(line);
        Ok(e)
    }

    fn par_list(&mut self) -> LuaResult<()> {
        let mut nparams: u32 = 0;
        if self.lex.token != Token::RParen {
            loop {
                match self.lex.token {
                    Token::Name(id) => {
                        self.next_token()?;
                        self.new_localvar(id)?;
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.next_token()?;
                        self.fs_mut().proto.is_vararg = true;
                    }
                    _ => {
                        return Err(self
                            .lex
                            .error_near(self.vm, "<name> or '...' expected"));
                    }
                }
                if self.fs().proto.is_vararg || !self.test_next(Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let nactvar = self.fs().nactvar;
        self.fs_mut().proto.numparams = nactvar;
        self.reserve_regs(nactvar as u32)
    }
}
