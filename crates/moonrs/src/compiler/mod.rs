// One-pass compiler: recursive descent directly into bytecode, no AST.
// The parser owns the lexer and a stack of FuncStates (innermost last);
// codegen lives in code.rs, expressions in expr.rs, statements in stmt.rs.

mod code;
mod expdesc;
mod expr;
mod func_state;
mod lexer;
pub mod parse_number;
mod stmt;
mod token;

pub use expdesc::{BinOp, ExpDesc, ExpKind, UnOp, NO_JUMP};
pub use lexer::{ChunkReader, Lexer, SliceReader};
pub use token::Token;

use crate::compiler::func_state::{BlockCnt, FuncState, LabelDesc, VarDesc};
use crate::gc::StrId;
use crate::lua_value::{Proto, UpvalDesc};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Local variables per function.
pub const MAX_VARS: usize = 200;
/// Upvalues per function.
pub const MAX_UPVALUES: usize = 255;
/// Nested non-terminal recursion while parsing.
pub const MAX_PARSE_DEPTH: u32 = 200;

pub struct LuaParser<'a> {
    pub lex: Lexer<'a>,
    pub vm: &'a mut LuaVM,
    /// FuncState stack; the function being compiled is last.
    pub fs: Vec<FuncState>,
    /// Active locals of all functions on the stack.
    pub actvar: Vec<VarDesc>,
    /// Active labels (per function slice via FuncState::first_label).
    pub labels: Vec<LabelDesc>,
    /// Pending gotos.
    pub gotos: Vec<LabelDesc>,
    depth: u32,
}

/// Compile a chunk from a reader into a prototype.
pub fn compile<'a>(
    vm: &'a mut LuaVM,
    reader: Box<dyn ChunkReader + 'a>,
    chunkname: &str,
) -> LuaResult<Proto> {
    let lex = Lexer::new(reader, chunkname);
    compile_with_lexer(vm, lex)
}

/// Compile from an already-primed lexer (used by `load`, which peeks at
/// the first byte to detect binary chunks).
pub fn compile_with_lexer<'a>(vm: &'a mut LuaVM, lex: Lexer<'a>) -> LuaResult<Proto> {
    let mut parser = LuaParser {
        lex,
        vm,
        fs: Vec::new(),
        actvar: Vec::new(),
        labels: Vec::new(),
        gotos: Vec::new(),
        depth: 0,
    };
    parser.main_func()
}

impl<'a> LuaParser<'a> {
    #[inline(always)]
    pub fn fs(&self) -> &FuncState {
        self.fs.last().expect("no function state")
    }

    #[inline(always)]
    pub fn fs_mut(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("no function state")
    }

    /// Interned-name equality; identifiers longer than the intern limit
    /// compare by content.
    fn name_eq(&self, a: StrId, b: StrId) -> bool {
        a == b || self.vm.pool.string(a).as_bytes() == self.vm.pool.string(b).as_bytes()
    }

    pub fn enter_level(&mut self) -> LuaResult<()> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(self.syntax_error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    pub fn leave_level(&mut self) {
        self.depth -= 1;
    }

    // ===== Token helpers =====

    pub fn next_token(&mut self) -> LuaResult<()> {
        self.lex.next_token(self.vm)
    }

    pub fn test_next(&mut self, t: Token) -> LuaResult<bool> {
        if self.lex.token == t {
            self.next_token()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn check(&mut self, t: Token) -> LuaResult<()> {
        if self.lex.token != t {
            let msg = format!("'{}' expected", t.fixed_text().unwrap_or("?"));
            return Err(self.lex.error_near(self.vm, &msg));
        }
        Ok(())
    }

    pub fn check_next(&mut self, t: Token) -> LuaResult<()> {
        self.check(t)?;
        self.next_token()
    }

    /// Close a construct opened at `line` with token `what`.
    pub fn check_match(&mut self, what: Token, who: Token, line: u32) -> LuaResult<()> {
        if self.lex.token == what {
            return self.next_token();
        }
        let msg = if line == self.lex.line {
            format!("'{}' expected", what.fixed_text().unwrap_or("?"))
        } else {
            format!(
                "'{}' expected (to close '{}' at line {})",
                what.fixed_text().unwrap_or("?"),
                who.fixed_text().unwrap_or("?"),
                line
            )
        };
        Err(self.lex.error_near(self.vm, &msg))
    }

    pub fn check_name(&mut self) -> LuaResult<StrId> {
        match self.lex.token {
            Token::Name(id) => {
                self.next_token()?;
                Ok(id)
            }
            _ => Err(self.lex.error_near(self.vm, "<name> expected")),
        }
    }

    pub fn check_condition(&mut self, ok: bool, msg: &str) -> LuaResult<()> {
        if ok {
            Ok(())
        } else {
            Err(self.lex.error_near(self.vm, msg))
        }
    }

    // ===== Local variables =====

    pub fn new_localvar(&mut self, name: StrId) -> LuaResult<()> {
        let fs = self.fs();
        let active = self.actvar.len() - fs.first_local;
        if active >= MAX_VARS {
            return Err(self.error_limit(MAX_VARS, "local variables"));
        }
        let fs = self.fs_mut();
        let locvar_idx = fs.proto.locvars.len() as u32;
        fs.proto.locvars.push(crate::lua_value::LocVar {
            name,
            start_pc: 0,
            end_pc: 0,
        });
        self.actvar.push(VarDesc { name, locvar_idx });
        Ok(())
    }

    pub fn new_localvar_literal(&mut self, name: &str) -> LuaResult<()> {
        let id = self.vm.intern(name);
        self.new_localvar(id)
    }

    /// Activate the last `nvars` registered locals: they become visible
    /// and their debug range starts at the current pc.
    pub fn adjust_local_vars(&mut self, nvars: u32) {
        let pc = self.fs().pc() as u32;
        let fs = self.fs_mut();
        fs.nactvar += nvars as u8;
        let first_local = fs.first_local;
        let nactvar = fs.nactvar as usize;
        for i in (nactvar - nvars as usize)..nactvar {
            let lv = self.actvar[first_local + i].locvar_idx as usize;
            self.fs_mut().proto.locvars[lv].start_pc = pc;
        }
    }

    /// Deactivate locals down to `tolevel`, closing their debug range.
    pub fn remove_vars(&mut self, tolevel: u8) {
        let pc = self.fs().pc() as u32;
        while self.fs().nactvar > tolevel {
            self.fs_mut().nactvar -= 1;
            let var = self.actvar.pop().expect("active variable underflow");
            let lv = var.locvar_idx as usize;
            self.fs_mut().proto.locvars[lv].end_pc = pc;
        }
    }

    /// Register index of an active local in function `level`, by name.
    fn search_var(&self, level: usize, name: StrId) -> Option<u32> {
        let fs = &self.fs[level];
        let first = fs.first_local;
        let n = fs.nactvar as usize;
        for i in (0..n).rev() {
            if self.name_eq(self.actvar[first + i].name, name) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Mark the block of function `level` containing register `reg` as
    /// having a captured local.
    fn mark_upval(&mut self, level: usize, reg: u32) {
        let fs = &mut self.fs[level];
        for bl in fs.blocks.iter_mut().rev() {
            if (bl.nactvar as u32) <= reg {
                bl.upval = true;
                return;
            }
        }
    }

    fn search_upvalue(&self, level: usize, name: StrId) -> Option<u32> {
        let ups = &self.fs[level].proto.upvalues;
        for (i, up) in ups.iter().enumerate() {
            if let Some(n) = up.name {
                if self.name_eq(n, name) {
                    return Some(i as u32);
                }
            }
        }
        None
    }

    fn new_upvalue(
        &mut self,
        level: usize,
        name: StrId,
        in_stack: bool,
        idx: u32,
    ) -> LuaResult<u32> {
        if self.fs[level].proto.upvalues.len() >= MAX_UPVALUES {
            return Err(self.error_limit(MAX_UPVALUES, "upvalues"));
        }
        let ups = &mut self.fs[level].proto.upvalues;
        ups.push(UpvalDesc {
            name: Some(name),
            in_stack,
            idx: idx as u8,
        });
        Ok(ups.len() as u32 - 1)
    }

    /// Resolve a name at function nesting `level`: local, upvalue chained
    /// through enclosing functions, or Void (meaning global).
    fn single_var_aux(&mut self, level: usize, name: StrId, base: bool) -> LuaResult<ExpDesc> {
        if let Some(reg) = self.search_var(level, name) {
            if !base {
                self.mark_upval(level, reg);
            }
            return Ok(ExpDesc::with_info(ExpKind::Local, reg));
        }
        if let Some(idx) = self.search_upvalue(level, name) {
            return Ok(ExpDesc::with_info(ExpKind::Upval, idx));
        }
        if level == 0 {
            return Ok(ExpDesc::new(ExpKind::Void));
        }
        let outer = self.single_var_aux(level - 1, name, false)?;
        match outer.kind {
            ExpKind::Local => {
                let idx = self.new_upvalue(level, name, true, outer.info)?;
                Ok(ExpDesc::with_info(ExpKind::Upval, idx))
            }
            ExpKind::Upval => {
                let idx = self.new_upvalue(level, name, false, outer.info)?;
                Ok(ExpDesc::with_info(ExpKind::Upval, idx))
            }
            _ => Ok(ExpDesc::new(ExpKind::Void)),
        }
    }

    /// Resolve a name in the current function; unknown names become
    /// `_ENV[name]` lookups.
    pub fn single_var(&mut self, name: StrId) -> LuaResult<ExpDesc> {
        let top = self.fs.len() - 1;
        let mut var = self.single_var_aux(top, name, true)?;
        if var.kind == ExpKind::Void {
            let env = self.vm.intern("_ENV");
            var = self.single_var_aux(top, env, true)?;
            debug_assert!(var.kind != ExpKind::Void, "_ENV is always declared");
            self.exp_to_any_reg_up(&mut var)?;
            let k = self.string_k(name)?;
            let mut key = ExpDesc::with_info(ExpKind::K, k);
            self.indexed(&mut var, &mut key)?;
        }
        Ok(var)
    }

    /// Balance an assignment/declaration: pad with nils or drop extra
    /// values; an open call or vararg at the tail is stretched to fit.
    pub fn adjust_assign(
        &mut self,
        nvars: i32,
        nexps: i32,
        e: &mut ExpDesc,
    ) -> LuaResult<()> {
        let mut extra = nvars - nexps;
        if e.has_multret() {
            // The open call itself provides one of the values.
            extra += 1;
            if extra < 0 {
                extra = 0;
            }
            self.set_returns(e, extra)?;
            if extra > 1 {
                self.reserve_regs((extra - 1) as u32)?;
            }
        } else {
            if e.kind != ExpKind::Void {
                self.exp_to_next_reg(e)?;
            }
            if extra > 0 {
                let reg = self.fs().freereg as u32;
                self.reserve_regs(extra as u32)?;
                self.emit_nil(reg, extra as u32);
            }
        }
        if nexps > nvars {
            self.fs_mut().freereg -= (nexps - nvars) as u8;
        }
        Ok(())
    }

    // ===== Blocks, gotos, labels =====

    pub fn enter_block(&mut self, is_loop: bool) {
        let first_label = self.labels.len();
        let first_goto = self.gotos.len();
        let fs = self.fs_mut();
        let nactvar = fs.nactvar;
        fs.blocks.push(BlockCnt {
            first_label,
            first_goto,
            nactvar,
            upval: false,
            is_loop,
        });
    }

    pub fn leave_block(&mut self) -> LuaResult<()> {
        let bl = self.fs_mut().blocks.pop().expect("no block to leave");
        if bl.is_loop {
            // Bind pending breaks to this point.
            let name = self.vm.intern("break");
            let pc = self.get_label();
            let label = LabelDesc {
                name,
                pc,
                line: 0,
                nactvar: bl.nactvar,
            };
            self.match_gotos(&label, bl.first_goto)?;
        }
        let inner = !self.fs().blocks.is_empty();
        if inner && bl.upval {
            // Locals of this block were captured: close them on exit.
            self.emit_abc(crate::lua_vm::OpCode::Close, bl.nactvar as u32, 0, 0);
        }
        self.remove_vars(bl.nactvar);
        debug_assert!(self.fs().nactvar == bl.nactvar);
        self.fs_mut().freereg = bl.nactvar;
        self.labels.truncate(bl.first_label);
        if inner {
            self.move_gotos_out(&bl)?;
        } else if bl.first_goto < self.gotos.len() {
            return Err(self.undefined_goto(bl.first_goto));
        }
        Ok(())
    }

    fn undefined_goto(&mut self, g: usize) -> LuaError {
        let gt = &self.gotos[g];
        let name = self.vm.pool.string_display(gt.name);
        let msg = if name == "break" {
            format!("break outside a loop at line {}", gt.line)
        } else {
            format!("no visible label '{}' for goto at line {}", name, gt.line)
        };
        self.syntax_error(&msg)
    }

    /// Bind a goto to a matching label, checking scope entry.
    fn close_goto(&mut self, g: usize, label_pc: i32, label_nactvar: u8) -> LuaResult<()> {
        let gt = &self.gotos[g];
        if gt.nactvar < label_nactvar {
            let name = self.vm.pool.string_display(gt.name);
            let msg = format!("goto '{}' jumps into the scope of a local", name);
            return Err(self.syntax_error(&msg));
        }
        let pc = self.gotos[g].pc;
        self.patch_list(pc, label_pc)?;
        self.gotos.remove(g);
        Ok(())
    }

    /// Match every pending goto of the current block against a label.
    fn match_gotos(&mut self, label: &LabelDesc, first_goto: usize) -> LuaResult<()> {
        let mut i = first_goto;
        while i < self.gotos.len() {
            if self.name_eq(self.gotos[i].name, label.name) {
                self.close_goto(i, label.pc, label.nactvar)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// On block exit, re-home the block's unresolved gotos to the
    /// enclosing block, noting upvalue closes along the way.
    fn move_gotos_out(&mut self, bl: &BlockCnt) -> LuaResult<()> {
        let mut i = bl.first_goto;
        while i < self.gotos.len() {
            if self.gotos[i].nactvar > bl.nactvar {
                if bl.upval {
                    let pc = self.gotos[i].pc;
                    self.patch_close(pc, bl.nactvar as u32);
                }
                self.gotos[i].nactvar = bl.nactvar;
            }
            if !self.find_label_for(i)? {
                i += 1;
            }
        }
        Ok(())
    }

    /// Try to bind pending goto `g` against the labels of the current
    /// block; true when bound.
    pub fn find_label_for(&mut self, g: usize) -> LuaResult<bool> {
        let bl_first_label = self.fs().block().first_label;
        for li in bl_first_label..self.labels.len() {
            if self.name_eq(self.labels[li].name, self.gotos[g].name) {
                let (pc, nact) = (self.labels[li].pc, self.labels[li].nactvar);
                let gt_nact = self.gotos[g].nactvar;
                let has_upval = self.fs().block().upval;
                if gt_nact > nact && (has_upval || self.labels.len() > bl_first_label) {
                    let gpc = self.gotos[g].pc;
                    self.patch_close(gpc, nact as u32);
                }
                self.close_goto(g, pc, nact)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn add_goto(&mut self, name: StrId, line: u32, pc: i32) -> LuaResult<()> {
        let nactvar = self.fs().nactvar;
        self.gotos.push(LabelDesc {
            name,
            pc,
            line,
            nactvar,
        });
        let g = self.gotos.len() - 1;
        self.find_label_for(g)?;
        Ok(())
    }

    pub fn add_label(&mut self, name: StrId, line: u32, last_in_block: bool) -> LuaResult<()> {
        // Repeated labels in the same function are an error.
        let first = self.fs().first_label;
        for li in first..self.labels.len() {
            if self.name_eq(self.labels[li].name, name) {
                let n = self.vm.pool.string_display(name);
                let msg = format!("label '{}' already defined", n);
                return Err(self.syntax_error(&msg));
            }
        }
        let pc = self.get_label();
        let nactvar = if last_in_block {
            self.fs().block().nactvar
        } else {
            self.fs().nactvar
        };
        self.labels.push(LabelDesc {
            name,
            pc,
            line,
            nactvar,
        });
        let label = LabelDesc {
            name,
            pc,
            line,
            nactvar,
        };
        let first_goto = self.fs().block().first_goto;
        self.match_gotos(&label, first_goto)
    }

    // ===== Function open/close =====

    pub fn open_func(&mut self, source: Option<StrId>, linedefined: u32) {
        let mut fs = FuncState::new(source, linedefined);
        fs.first_local = self.actvar.len();
        fs.first_label = self.labels.len();
        fs.first_goto = self.gotos.len();
        self.fs.push(fs);
        self.enter_block(false);
    }

    pub fn close_func(&mut self) -> LuaResult<Proto> {
        self.emit_return(0, 0);
        self.leave_block()?;
        let fs = self.fs.pop().expect("function state underflow");
        Ok(fs.proto)
    }

    fn main_func(&mut self) -> LuaResult<Proto> {
        let source = self.vm.intern(&self.lex.chunkname.clone());
        self.open_func(Some(source), 0);
        self.fs_mut().proto.is_vararg = true;
        // The chunk reads its globals through an _ENV upvalue.
        let env = self.vm.intern("_ENV");
        self.fs_mut().proto.upvalues.push(UpvalDesc {
            name: Some(env),
            in_stack: true,
            idx: 0,
        });
        self.next_token()?;
        self.stat_list()?;
        if self.lex.token != Token::Eos {
            return Err(self.lex.error_near(self.vm, "'<eof>' expected"));
        }
        let mut proto = self.close_func()?;
        proto.lastlinedefined = self.lex.line;
        debug_assert!(self.fs.is_empty());
        Ok(proto)
    }
}
