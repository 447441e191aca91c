// Statement grammar. Every statement resets freereg to nactvar on the
// way out; blocks and loops manage their scopes through the BlockCnt
// stack in mod.rs.

use crate::compiler::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use crate::compiler::token::Token;
use crate::compiler::LuaParser;
use crate::lua_vm::{Instruction, LuaResult, OpCode};

impl<'a> LuaParser<'a> {
    /// statlist -> { stat [';'] }; stops at a block-closing token, and a
    /// return statement finishes the list.
    pub fn stat_list(&mut self) -> LuaResult<()> {
        while !self.block_follow(true) {
            if self.lex.token == Token::Return {
                self.statement()?;
                return Ok(());
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block_follow(&self, with_until: bool) -> bool {
        match self.lex.token {
            Token::Else | Token::ElseIf | Token::End | Token::Eos => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    /// A block in its own scope.
    pub fn block(&mut self) -> LuaResult<()> {
        self.enter_block(false);
        self.stat_list()?;
        self.leave_block()
    }

    fn statement(&mut self) -> LuaResult<()> {
        let line = self.lex.line;
        self.enter_level()?;
        match self.lex.token {
            Token::Semi => {
                self.next_token()?;
            }
            Token::If => {
                self.if_stat(line)?;
            }
            Token::While => {
                self.while_stat(line)?;
            }
            Token::Do => {
                self.next_token()?;
                self.block()?;
                self.check_match(Token::End, Token::Do, line)?;
            }
            Token::For => {
                self.for_stat(line)?;
            }
            Token::Repeat => {
                self.repeat_stat(line)?;
            }
            Token::Function => {
                self.func_stat(line)?;
            }
            Token::Local => {
                self.next_token()?;
                if self.test_next(Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DbColon => {
                self.next_token()?;
                self.label_stat(line)?;
            }
            Token::Return => {
                self.next_token()?;
                self.ret_stat()?;
            }
            Token::Break | Token::Goto => {
                self.goto_stat(line)?;
            }
            _ => {
                self.expr_stat()?;
            }
        }
        debug_assert!(self.fs().freereg >= self.fs().nactvar);
        let nactvar = self.fs().nactvar;
        self.fs_mut().freereg = nactvar;
        self.leave_level();
        Ok(())
    }

    // ===== Conditions and control =====

    /// cond -> exp, producing the false-exit jump list.
    fn cond(&mut self) -> LuaResult<i32> {
        let mut v = self.expr()?;
        if v.kind == ExpKind::Nil {
            // nil is false in a condition.
            v.kind = ExpKind::False;
        }
        self.go_if_true(&mut v)?;
        Ok(v.f)
    }

    fn test_then_block(&mut self) -> LuaResult<i32> {
        self.next_token()?; // skip IF or ELSEIF
        let flist = self.cond()?;
        self.check_next(Token::Then)?;
        self.block()?;
        Ok(flist)
    }

    fn if_stat(&mut self, line: u32) -> LuaResult<()> {
        let mut escape = NO_JUMP;
        let mut flist = self.test_then_block()?;
        while self.lex.token == Token::ElseIf {
            let j = self.jump()?;
            self.concat_jump(&mut escape, j)?;
            self.patch_to_here(flist)?;
            flist = self.test_then_block()?;
        }
        if self.lex.token == Token::Else {
            let j = self.jump()?;
            self.concat_jump(&mut escape, j)?;
            self.patch_to_here(flist)?;
            self.next_token()?;
            self.block()?;
        } else {
            self.concat_jump(&mut escape, flist)?;
        }
        self.patch_to_here(escape)?;
        self.check_match(Token::End, Token::If, line)
    }

    fn while_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next_token()?; // skip WHILE
        let init = self.get_label();
        let cond_exit = self.cond()?;
        self.enter_block(true);
        self.check_next(Token::Do)?;
        self.block()?;
        let back = self.jump()?;
        self.patch_list(back, init)?;
        self.check_match(Token::End, Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(cond_exit)
    }

    fn repeat_stat(&mut self, line: u32) -> LuaResult<()> {
        let init = self.get_label();
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.next_token()?; // skip REPEAT
        self.stat_list()?;
        self.check_match(Token::Until, Token::Repeat, line)?;
        // The condition can see the loop body's locals.
        let cond_exit = self.cond()?;
        let scope_has_upval = self.fs().block().upval;
        if !scope_has_upval {
            self.leave_block()?;
            self.patch_list(cond_exit, init)?;
        } else {
            // Upvalues must be closed on every path out of the scope.
            self.break_stat(line)?;
            self.patch_to_here(cond_exit)?;
            self.leave_block()?;
            let back = self.jump()?;
            self.patch_list(back, init)?;
        }
        self.leave_block()
    }

    // ===== for =====

    /// One expression, discharged onto the stack top.
    fn exp1(&mut self) -> LuaResult<()> {
        let mut e = self.expr()?;
        self.exp_to_next_reg(&mut e)?;
        Ok(())
    }

    fn for_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next_token()?; // skip FOR
        self.enter_block(true);
        let name = self.check_name()?;
        match self.lex.token {
            Token::Assign => self.for_num(name, line)?,
            Token::Comma | Token::In => self.for_list(name)?,
            _ => {
                return Err(self.lex.error_near(self.vm, "'=' or 'in' expected"));
            }
        }
        self.check_match(Token::End, Token::For, line)?;
        self.leave_block()
    }

    fn for_num(&mut self, varname: crate::gc::StrId, line: u32) -> LuaResult<()> {
        let base = self.fs().freereg as u32;
        self.new_localvar_literal("(for index)")?;
        self.new_localvar_literal("(for limit)")?;
        self.new_localvar_literal("(for step)")?;
        self.new_localvar(varname)?;
        self.check_next(Token::Assign)?;
        self.exp1()?; // initial value
        self.check_next(Token::Comma)?;
        self.exp1()?; // limit
        if self.test_next(Token::Comma)? {
            self.exp1()?; // step
        } else {
            // Default step 1.
            let k = self.int_k(1)?;
            let reg = self.fs().freereg as u32;
            self.emit_loadk(reg, k);
            self.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn for_list(&mut self, indexname: crate::gc::StrId) -> LuaResult<()> {
        let base = self.fs().freereg as u32;
        self.new_localvar_literal("(for generator)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for control)")?;
        self.new_localvar(indexname)?;
        let mut nvars: u32 = 1;
        while self.test_next(Token::Comma)? {
            let n = self.check_name()?;
            self.new_localvar(n)?;
            nvars += 1;
        }
        self.check_next(Token::In)?;
        let line = self.lex.line;
        let (nexps, mut e) = self.exp_list()?;
        self.adjust_assign(3, nexps, &mut e)?;
        // Extra slots to call the generator.
        self.check_stack(3)?;
        self.for_body(base, line, nvars, false)
    }

    fn for_body(&mut self, base: u32, line: u32, nvars: u32, is_num: bool) -> LuaResult<()> {
        self.adjust_local_vars(3); // control variables
        self.check_next(Token::Do)?;
        let prep = if is_num {
            self.emit_asbx(OpCode::ForPrep, base, NO_JUMP)
        } else {
            self.jump()?
        };
        self.enter_block(false); // scope for declared variables
        self.adjust_local_vars(nvars);
        self.reserve_regs(nvars)?;
        self.block()?;
        self.leave_block()?;
        self.patch_to_here(prep)?;
        let endfor = if is_num {
            self.emit_asbx(OpCode::ForLoop, base, NO_JUMP)
        } else {
            self.emit_abc(OpCode::TForCall, base, 0, nvars);
            self.fix_line(line);
            self.emit_asbx(OpCode::TForLoop, base + 2, NO_JUMP)
        };
        self.patch_list(endfor, prep + 1)?;
        self.fix_line(line);
        Ok(())
    }

    // ===== Functions =====

    /// funcname -> NAME {'.' NAME} [':' NAME]; returns the target and
    /// whether it is a method.
    fn func_name(&mut self) -> LuaResult<(ExpDesc, bool)> {
        let name = self.check_name()?;
        let mut v = self.single_var(name)?;
        while self.lex.token == Token::Dot {
            self.next_token()?;
            let field = self.check_name()?;
            self.exp_to_any_reg_up(&mut v)?;
            let k = self.string_k(field)?;
            let mut key = ExpDesc::with_info(ExpKind::K, k);
            self.indexed(&mut v, &mut key)?;
        }
        let mut is_method = false;
        if self.lex.token == Token::Colon {
            self.next_token()?;
            let field = self.check_name()?;
            self.exp_to_any_reg_up(&mut v)?;
            let k = self.string_k(field)?;
            let mut key = ExpDesc::with_info(ExpKind::K, k);
            self.indexed(&mut v, &mut key)?;
            is_method = true;
        }
        Ok((v, is_method))
    }

    fn func_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next_token()?; // skip FUNCTION
        let (v, is_method) = self.func_name()?;
        let mut b = self.body(is_method, line)?;
        self.store_var(&v, &mut b)?;
        self.fix_line(line);
        Ok(())
    }

    fn local_func(&mut self) -> LuaResult<()> {
        let name = self.check_name()?;
        self.new_localvar(name)?;
        // The local is in scope inside its own body, so recursion works.
        self.adjust_local_vars(1);
        let line = self.lex.line;
        let b = self.body(false, line)?;
        debug_assert!(b.kind == ExpKind::NonReloc);
        // Debug range starts after the closure is in its register.
        let pc = self.fs().pc() as u32;
        let fs = self.fs();
        let lv = self.actvar[fs.first_local + fs.nactvar as usize - 1].locvar_idx as usize;
        self.fs_mut().proto.locvars[lv].start_pc = pc;
        Ok(())
    }

    fn local_stat(&mut self) -> LuaResult<()> {
        let mut nvars = 0;
        loop {
            let name = self.check_name()?;
            self.new_localvar(name)?;
            nvars += 1;
            if !self.test_next(Token::Comma)? {
                break;
            }
        }
        let (nexps, mut e) = if self.test_next(Token::Assign)? {
            self.exp_list()?
        } else {
            (0, ExpDesc::new(ExpKind::Void))
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars as u32);
        Ok(())
    }

    // ===== Assignment and calls =====

    /// Detect an assignment target that aliases a value also being read,
    /// and reroute earlier targets through a fresh copy so the statement
    /// behaves like a simultaneous assignment.
    fn check_conflict(&mut self, targets: &[ExpDesc], v: &ExpDesc) -> LuaResult<Vec<ExpDesc>> {
        let extra = self.fs().freereg as u32;
        let mut conflict = false;
        let mut fixed: Vec<ExpDesc> = targets.to_vec();
        for t in fixed.iter_mut() {
            if t.kind == ExpKind::Indexed {
                if v.kind == ExpKind::Local && t.ind_t == v.info {
                    conflict = true;
                    t.ind_t = extra;
                }
                if v.kind == ExpKind::Local
                    && !Instruction::is_k(t.ind_idx)
                    && t.ind_idx == v.info
                {
                    conflict = true;
                    t.ind_idx = extra;
                }
            } else if t.kind == ExpKind::IndexUp
                && v.kind == ExpKind::Upval
                && t.ind_t == v.info
            {
                conflict = true;
                fixed_upval_to_reg(t, extra);
            }
        }
        if conflict {
            let op = if v.kind == ExpKind::Local {
                OpCode::Move
            } else {
                OpCode::GetUpval
            };
            self.emit_abc(op, extra, v.info, 0);
            self.reserve_regs(1)?;
        }
        Ok(fixed)
    }

    /// One recursion level per assignment target; values are stored right
    /// to left as the recursion unwinds.
    fn rest_assign(&mut self, targets: &mut Vec<ExpDesc>) -> LuaResult<()> {
        self.enter_level()?;
        let mut stored = false;
        if self.test_next(Token::Comma)? {
            let nv = self.suffixed_exp()?;
            self.check_condition(nv.is_var(), "syntax error near assignment")?;
            if matches!(nv.kind, ExpKind::Local | ExpKind::Upval) {
                *targets = self.check_conflict(targets, &nv)?;
            }
            targets.push(nv);
            self.rest_assign(targets)?;
        } else {
            self.check_next(Token::Assign)?;
            let nvars = targets.len() as i32;
            let (nexps, mut e) = self.exp_list()?;
            if nexps != nvars {
                self.adjust_assign(nvars, nexps, &mut e)?;
            } else {
                self.set_one_ret(&mut e);
                let t = targets.pop().expect("assignment target");
                self.store_var(&t, &mut e)?;
                stored = true;
            }
        }
        if !stored {
            // Default: this level's target takes the value on the stack
            // top.
            let t = targets.pop().expect("assignment target");
            let reg = self.fs().freereg as u32 - 1;
            let mut e = ExpDesc::with_info(ExpKind::NonReloc, reg);
            self.store_var(&t, &mut e)?;
        }
        self.leave_level();
        Ok(())
    }

    fn expr_stat(&mut self) -> LuaResult<()> {
        let v = self.suffixed_exp()?;
        if self.lex.token == Token::Assign || self.lex.token == Token::Comma {
            self.check_condition(v.is_var(), "syntax error near assignment")?;
            let mut targets = vec![v];
            self.rest_assign(&mut targets)?;
            debug_assert!(targets.is_empty());
            Ok(())
        } else {
            self.check_condition(v.kind == ExpKind::Call, "syntax error")?;
            // A call statement discards its results.
            let fs = self.fs_mut();
            Instruction::set_c(&mut fs.proto.code[v.info as usize], 1);
            Ok(())
        }
    }

    fn ret_stat(&mut self) -> LuaResult<()> {
        let (first, nret) = if self.block_follow(true) || self.lex.token == Token::Semi {
            (0, 0)
        } else {
            let (mut nret, mut e) = self.exp_list()?;
            if e.has_multret() {
                self.set_returns(&e, -1)?;
                if e.kind == ExpKind::Call && nret == 1 {
                    // return f(...) reuses the frame.
                    let nactvar = self.fs().nactvar as u32;
                    let fs = self.fs_mut();
                    let i = &mut fs.proto.code[e.info as usize];
                    Instruction::set_opcode(i, OpCode::TailCall);
                    debug_assert!(Instruction::a(*i) == nactvar);
                }
                nret = -1;
                (self.fs().nactvar as u32, nret)
            } else if nret == 1 {
                let r = self.exp_to_any_reg(&mut e)?;
                (r, 1)
            } else {
                self.exp_to_next_reg(&mut e)?;
                let first = self.fs().nactvar as u32;
                debug_assert!(nret == self.fs().freereg as i32 - first as i32);
                (first, nret)
            }
        };
        self.emit_return(first, nret);
        self.test_next(Token::Semi)?;
        Ok(())
    }

    // ===== goto / labels / break =====

    fn goto_stat(&mut self, line: u32) -> LuaResult<()> {
        let pc = self.jump()?;
        if self.test_next(Token::Goto)? {
            let name = self.check_name()?;
            self.add_goto(name, line, pc)
        } else {
            self.next_token()?; // skip BREAK
            let name = self.vm.intern("break");
            self.add_goto(name, line, pc)
        }
    }

    /// An explicit break emission used by repeat-with-upvalues.
    fn break_stat(&mut self, line: u32) -> LuaResult<()> {
        let pc = self.jump()?;
        let name = self.vm.intern("break");
        self.add_goto(name, line, pc)
    }

    fn label_stat(&mut self, line: u32) -> LuaResult<()> {
        let name = self.check_name()?;
        self.check_next(Token::DbColon)?;
        // Skip trailing semicolons so a label at the end of a block can
        // match gotos from outside the locals' scope.
        while self.lex.token == Token::Semi {
            self.next_token()?;
        }
        let last = self.block_follow(false);
        self.add_label(name, line, last)
    }
}

/// Rewrite an upvalue-held table target to read the saved register copy.
fn fixed_upval_to_reg(t: &mut ExpDesc, reg: u32) {
    t.kind = ExpKind::Indexed;
    t.ind_t = reg;
}
