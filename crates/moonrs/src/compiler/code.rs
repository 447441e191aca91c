// Code generation over expression descriptors: register discharge, jump
// list patching, constant pooling and folding, operator emission. The
// grammar side lives in expr.rs / stmt.rs; everything here is a side
// effect on the innermost FuncState.

use crate::compiler::expdesc::{BinOp, ExpDesc, ExpKind, UnOp, NO_JUMP};
use crate::compiler::func_state::ConstKey;
use crate::compiler::LuaParser;
use crate::lua_value::Value;
use crate::lua_vm::arith::{raw_arith, ArithOp};
use crate::lua_vm::{Instruction, LuaError, LuaResult, OpCode};

/// Registers available to one function frame.
pub const MAX_REGS: u32 = 250;

impl<'a> LuaParser<'a> {
    // ===== Raw emission =====

    pub fn emit(&mut self, i: u32, line: u32) -> i32 {
        self.discharge_jpc();
        let fs = self.fs_mut();
        fs.proto.code.push(i);
        fs.proto.lineinfo.push(line);
        fs.pc() - 1
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> i32 {
        let line = self.lex.lastline;
        self.emit(Instruction::abc(op, a, b, c), line)
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32) -> i32 {
        let line = self.lex.lastline;
        self.emit(Instruction::abx(op, a, bx), line)
    }

    pub fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> i32 {
        let line = self.lex.lastline;
        self.emit(Instruction::asbx(op, a, sbx), line)
    }

    /// LOADK, or LOADKX + EXTRAARG when the constant index outgrows Bx.
    pub fn emit_loadk(&mut self, reg: u32, k: u32) -> i32 {
        if k <= Instruction::MAX_BX {
            self.emit_abx(OpCode::LoadK, reg, k)
        } else {
            let pc = self.emit_abx(OpCode::LoadKx, reg, 0);
            let line = self.lex.lastline;
            self.emit(Instruction::ax_op(OpCode::ExtraArg, k), line);
            pc
        }
    }

    /// Emit LOADNIL, merging into a previous adjacent one when possible.
    pub fn emit_nil(&mut self, from: u32, n: u32) {
        let fs = self.fs_mut();
        if fs.pc() > fs.lasttarget && fs.jpc == NO_JUMP {
            if let Some(prev) = fs.proto.code.last_mut() {
                if Instruction::opcode(*prev) == OpCode::LoadNil {
                    let pfrom = Instruction::a(*prev);
                    let pto = pfrom + Instruction::b(*prev);
                    if pfrom <= from && from <= pto + 1 {
                        let new_to = (from + n - 1).max(pto);
                        Instruction::set_b(prev, new_to - pfrom);
                        return;
                    }
                }
            }
        }
        self.emit_abc(OpCode::LoadNil, from, n - 1, 0);
    }

    pub fn emit_return(&mut self, first: u32, nret: i32) {
        self.emit_abc(OpCode::Return, first, (nret + 1) as u32, 0);
    }

    pub fn fix_line(&mut self, line: u32) {
        let fs = self.fs_mut();
        if let Some(l) = fs.proto.lineinfo.last_mut() {
            *l = line;
        }
    }

    // ===== Errors =====

    pub fn syntax_error(&mut self, msg: &str) -> LuaError {
        self.lex.error(self.vm, msg)
    }

    pub fn error_limit(&mut self, limit: usize, what: &str) -> LuaError {
        let msg = format!("too many {} (limit is {})", what, limit);
        self.lex.error(self.vm, &msg)
    }

    // ===== Jump lists =====

    pub fn jump(&mut self) -> LuaResult<i32> {
        let save = self.fs().jpc;
        self.fs_mut().jpc = NO_JUMP;
        let mut j = self.emit_asbx(OpCode::Jmp, 0, NO_JUMP);
        self.concat_jump(&mut j, save)?;
        Ok(j)
    }

    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> LuaResult<i32> {
        self.emit_abc(op, a, b, c);
        self.jump()
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> LuaResult<()> {
        let offset = dest - (pc + 1);
        debug_assert!(dest != NO_JUMP);
        if offset.abs() > Instruction::OFFSET_SBX {
            return Err(self.syntax_error("control structure too long"));
        }
        let fs = self.fs_mut();
        Instruction::set_sbx(&mut fs.proto.code[pc as usize], offset);
        Ok(())
    }

    fn get_jump(&self, pc: i32) -> i32 {
        let offset = Instruction::sbx(self.fs().proto.code[pc as usize]);
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    /// The instruction controlling a jump: the comparison or test right
    /// before it, if any.
    fn jump_control_pc(&self, pc: i32) -> i32 {
        if pc >= 1 {
            let prev = self.fs().proto.code[pc as usize - 1];
            if matches!(
                Instruction::opcode(prev),
                OpCode::Eq | OpCode::Lt | OpCode::Le | OpCode::Test | OpCode::TestSet
            ) {
                return pc - 1;
            }
        }
        pc
    }

    /// Mark the pc of the next instruction as a jump target.
    pub fn get_label(&mut self) -> i32 {
        let fs = self.fs_mut();
        fs.lasttarget = fs.pc();
        fs.pc()
    }

    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let ctl = self.jump_control_pc(node);
        let i = self.fs().proto.code[ctl as usize];
        if Instruction::opcode(i) != OpCode::TestSet {
            return false;
        }
        let b = Instruction::b(i);
        let fs = self.fs_mut();
        if reg != Instruction::NO_REG && reg != b {
            Instruction::set_a(&mut fs.proto.code[ctl as usize], reg);
        } else {
            // No register to put the value in, or it is already there:
            // plain TEST.
            fs.proto.code[ctl as usize] =
                Instruction::abc(OpCode::Test, b, 0, Instruction::c(i));
        }
        true
    }

    /// Does some jump in the list need its value materialized (it is not a
    /// value-producing TESTSET)?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ctl = self.jump_control_pc(list);
            if Instruction::opcode(self.fs().proto.code[ctl as usize]) != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    pub fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, Instruction::NO_REG);
            list = self.get_jump(list);
        }
    }

    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> LuaResult<()> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Flush pending jumps-to-here into the instruction about to be
    /// emitted, so jumps landing on the next pc need no no-op.
    fn discharge_jpc(&mut self) {
        let jpc = self.fs().jpc;
        self.fs_mut().jpc = NO_JUMP;
        let pc = self.fs().pc();
        // Offsets to the very next instruction always fit.
        let _ = self.patch_list_aux(jpc, pc, Instruction::NO_REG, pc);
    }

    pub fn patch_list(&mut self, list: i32, target: i32) -> LuaResult<()> {
        if target == self.fs().pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.fs().pc());
            self.patch_list_aux(list, target, Instruction::NO_REG, target)
        }
    }

    /// Make every jump in the list close upvalues down to `level` when
    /// taken.
    pub fn patch_close(&mut self, mut list: i32, level: u32) {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            let fs = self.fs_mut();
            let i = &mut fs.proto.code[list as usize];
            debug_assert!(Instruction::opcode(*i) == OpCode::Jmp);
            Instruction::set_a(i, level + 1);
            list = next;
        }
    }

    pub fn patch_to_here(&mut self, list: i32) -> LuaResult<()> {
        self.get_label();
        let mut jpc = self.fs().jpc;
        self.concat_jump(&mut jpc, list)?;
        self.fs_mut().jpc = jpc;
        Ok(())
    }

    pub fn concat_jump(&mut self, l1: &mut i32, l2: i32) -> LuaResult<()> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)
    }

    // ===== Registers =====

    pub fn check_stack(&mut self, n: u32) -> LuaResult<()> {
        let needed = self.fs().freereg as u32 + n;
        if needed > MAX_REGS {
            return Err(self.syntax_error("function or expression too complex"));
        }
        let fs = self.fs_mut();
        if needed > fs.proto.maxstacksize as u32 {
            fs.proto.maxstacksize = needed as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: u32) -> LuaResult<()> {
        self.check_stack(n)?;
        self.fs_mut().freereg += n as u8;
        Ok(())
    }

    fn free_reg(&mut self, r: u32) {
        let fs = self.fs_mut();
        if r >= fs.nactvar as u32 {
            fs.freereg -= 1;
            debug_assert!(r == fs.freereg as u32);
        }
    }

    fn free_rk(&mut self, r: u32) {
        if !Instruction::is_k(r) {
            self.free_reg(r);
        }
    }

    pub fn free_exp(&mut self, e: &ExpDesc) {
        if e.kind == ExpKind::NonReloc {
            self.free_reg(e.info);
        }
    }

    // ===== Constants =====

    fn add_constant(&mut self, key: ConstKey, v: Value) -> LuaResult<u32> {
        let fs = self.fs_mut();
        if let Some(&idx) = fs.const_map.get(&key) {
            return Ok(idx);
        }
        let idx = fs.proto.constants.len() as u32;
        if idx > Instruction::MAX_AX {
            return Err(self.error_limit(Instruction::MAX_AX as usize, "constants"));
        }
        let fs = self.fs_mut();
        fs.proto.constants.push(v);
        fs.const_map.insert(key, idx);
        Ok(idx)
    }

    pub fn string_k(&mut self, s: crate::gc::StrId) -> LuaResult<u32> {
        self.add_constant(ConstKey::Str(s), Value::Str(s))
    }

    pub fn int_k(&mut self, i: i64) -> LuaResult<u32> {
        self.add_constant(ConstKey::Int(i), Value::Int(i))
    }

    pub fn flt_k(&mut self, n: f64) -> LuaResult<u32> {
        self.add_constant(ConstKey::Float(n.to_bits()), Value::Float(n))
    }

    fn bool_k(&mut self, b: bool) -> LuaResult<u32> {
        let key = if b { ConstKey::True } else { ConstKey::False };
        self.add_constant(key, Value::Bool(b))
    }

    fn nil_k(&mut self) -> LuaResult<u32> {
        self.add_constant(ConstKey::Nil, Value::Nil)
    }

    // ===== Multi-result adjustment =====

    pub fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> LuaResult<()> {
        match e.kind {
            ExpKind::Call => {
                let fs = self.fs_mut();
                Instruction::set_c(
                    &mut fs.proto.code[e.info as usize],
                    (nresults + 1) as u32,
                );
            }
            ExpKind::Vararg => {
                let freereg = self.fs().freereg as u32;
                let fs = self.fs_mut();
                let i = &mut fs.proto.code[e.info as usize];
                Instruction::set_b(i, (nresults + 1) as u32);
                Instruction::set_a(i, freereg);
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call => {
                e.kind = ExpKind::NonReloc;
                e.info = Instruction::a(self.fs().proto.code[e.info as usize]);
            }
            ExpKind::Vararg => {
                let fs = self.fs_mut();
                Instruction::set_b(&mut fs.proto.code[e.info as usize], 2);
                e.kind = ExpKind::Reloc;
            }
            _ => {}
        }
    }

    // ===== Discharge =====

    /// Reduce a variable-ish expression to at most one pending-register
    /// state.
    pub fn discharge_vars(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Local => {
                e.kind = ExpKind::NonReloc;
            }
            ExpKind::Upval => {
                e.info = self.emit_abc(OpCode::GetUpval, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::Indexed => {
                self.free_rk(e.ind_idx);
                self.free_reg(e.ind_t);
                e.info = self.emit_abc(OpCode::GetTable, 0, e.ind_t, e.ind_idx) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::IndexUp => {
                e.info = self.emit_abc(OpCode::GetTabUp, 0, e.ind_t, e.ind_idx) as u32;
                e.kind = ExpKind::Reloc;
            }
            ExpKind::Call | ExpKind::Vararg => {
                self.set_one_ret(e);
            }
            _ => {}
        }
    }

    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> LuaResult<()> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil => {
                self.emit_nil(reg, 1);
            }
            ExpKind::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0);
            }
            ExpKind::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0);
            }
            ExpKind::K => {
                let k = e.info;
                self.emit_loadk(reg, k);
            }
            ExpKind::KInt => {
                let k = self.int_k(e.ival)?;
                self.emit_loadk(reg, k);
            }
            ExpKind::KFlt => {
                let k = self.flt_k(e.nval)?;
                self.emit_loadk(reg, k);
            }
            ExpKind::Reloc => {
                let fs = self.fs_mut();
                Instruction::set_a(&mut fs.proto.code[e.info as usize], reg);
            }
            ExpKind::NonReloc => {
                if reg != e.info {
                    self.emit_abc(OpCode::Move, reg, e.info, 0);
                }
            }
            ExpKind::Jmp => return Ok(()),
            _ => {
                debug_assert!(e.kind == ExpKind::Void);
                return Ok(());
            }
        }
        e.info = reg;
        e.kind = ExpKind::NonReloc;
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        if e.kind != ExpKind::NonReloc {
            self.reserve_regs(1)?;
            let reg = self.fs().freereg as u32 - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    fn code_label(&mut self, a: u32, b: u32, jump: u32) -> i32 {
        self.get_label();
        self.emit_abc(OpCode::LoadBool, a, b, jump)
    }

    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> LuaResult<()> {
        self.discharge_to_reg(e, reg)?;
        if e.kind == ExpKind::Jmp {
            let mut t = e.t;
            self.concat_jump(&mut t, e.info as i32)?;
            e.t = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if e.kind == ExpKind::Jmp {
                    NO_JUMP
                } else {
                    self.jump()?
                };
                p_f = self.code_label(reg, 0, 1);
                p_t = self.code_label(reg, 1, 0);
                self.patch_to_here(fj)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, p_f)?;
            self.patch_list_aux(e.t, end, reg, p_t)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.info = reg;
        e.kind = ExpKind::NonReloc;
        Ok(())
    }

    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs().freereg as u32 - 1;
        self.exp_to_reg(e, reg)
    }

    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> LuaResult<u32> {
        self.discharge_vars(e);
        if e.kind == ExpKind::NonReloc {
            if !e.has_jumps() {
                return Ok(e.info);
            }
            if e.info >= self.fs().nactvar as u32 {
                let reg = e.info;
                self.exp_to_reg(e, reg)?;
                return Ok(e.info);
            }
        }
        self.exp_to_next_reg(e)?;
        Ok(e.info)
    }

    /// Leave the expression in a register or as an upvalue.
    pub fn exp_to_any_reg_up(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        if e.kind != ExpKind::Upval || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        }
        Ok(())
    }

    pub fn exp_to_val(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e);
        }
        Ok(())
    }

    /// Best operand form: constant index when it fits the RK field,
    /// register otherwise.
    pub fn exp_to_rk(&mut self, e: &mut ExpDesc) -> LuaResult<u32> {
        self.exp_to_val(e)?;
        match e.kind {
            ExpKind::Nil => {
                if self.fs().proto.constants.len() as u32 <= Instruction::MAX_INDEX_RK {
                    e.info = self.nil_k()?;
                    e.kind = ExpKind::K;
                    return Ok(Instruction::rk_as_k(e.info));
                }
            }
            ExpKind::True | ExpKind::False => {
                if self.fs().proto.constants.len() as u32 <= Instruction::MAX_INDEX_RK {
                    e.info = self.bool_k(e.kind == ExpKind::True)?;
                    e.kind = ExpKind::K;
                    return Ok(Instruction::rk_as_k(e.info));
                }
            }
            ExpKind::KInt => {
                if self.fs().proto.constants.len() as u32 <= Instruction::MAX_INDEX_RK {
                    e.info = self.int_k(e.ival)?;
                    e.kind = ExpKind::K;
                    return Ok(Instruction::rk_as_k(e.info));
                }
            }
            ExpKind::KFlt => {
                if self.fs().proto.constants.len() as u32 <= Instruction::MAX_INDEX_RK {
                    e.info = self.flt_k(e.nval)?;
                    e.kind = ExpKind::K;
                    return Ok(Instruction::rk_as_k(e.info));
                }
            }
            ExpKind::K => {
                if e.info <= Instruction::MAX_INDEX_RK {
                    return Ok(Instruction::rk_as_k(e.info));
                }
            }
            _ => {}
        }
        self.exp_to_any_reg(e)
    }

    // ===== Assignment targets =====

    pub fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> LuaResult<()> {
        match var.kind {
            ExpKind::Local => {
                self.free_exp(ex);
                return self.exp_to_reg(ex, var.info);
            }
            ExpKind::Upval => {
                let r = self.exp_to_any_reg(ex)?;
                self.emit_abc(OpCode::SetUpval, r, var.info, 0);
            }
            ExpKind::Indexed => {
                let r = self.exp_to_rk(ex)?;
                self.emit_abc(OpCode::SetTable, var.ind_t, var.ind_idx, r);
            }
            ExpKind::IndexUp => {
                let r = self.exp_to_rk(ex)?;
                self.emit_abc(OpCode::SetTabUp, var.ind_t, var.ind_idx, r);
            }
            _ => unreachable!("invalid assignment target"),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `e:key` method prefetch: SELF puts the method and the receiver in
    /// two consecutive fresh registers.
    pub fn emit_self(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> LuaResult<()> {
        self.exp_to_any_reg(e)?;
        let e_reg = e.info;
        self.free_exp(e);
        let base = self.fs().freereg as u32;
        self.reserve_regs(2)?;
        let k = self.exp_to_rk(key)?;
        self.emit_abc(OpCode::Self_, base, e_reg, k);
        self.free_exp(key);
        e.info = base;
        e.kind = ExpKind::NonReloc;
        Ok(())
    }

    /// Fold `t[k]` into an indexed descriptor. The table must already be
    /// in a register or an upvalue.
    pub fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> LuaResult<()> {
        let idx = self.exp_to_rk(k)?;
        if t.kind == ExpKind::Upval {
            t.ind_t = t.info;
            t.ind_idx = idx;
            t.kind = ExpKind::IndexUp;
        } else {
            t.ind_t = t.info;
            t.ind_idx = idx;
            t.kind = ExpKind::Indexed;
        }
        Ok(())
    }

    // ===== Conditions =====

    fn invert_jump(&mut self, e: &ExpDesc) {
        let ctl = self.jump_control_pc(e.info as i32);
        let fs = self.fs_mut();
        let i = &mut fs.proto.code[ctl as usize];
        debug_assert!(matches!(
            Instruction::opcode(*i),
            OpCode::Eq | OpCode::Lt | OpCode::Le
        ));
        let a = Instruction::a(*i);
        Instruction::set_a(i, if a == 0 { 1 } else { 0 });
    }

    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> LuaResult<i32> {
        if e.kind == ExpKind::Reloc {
            let ie = self.fs().proto.code[e.info as usize];
            if Instruction::opcode(ie) == OpCode::Not {
                // Remove the NOT and test its operand with the condition
                // inverted.
                let fs = self.fs_mut();
                fs.proto.code.pop();
                fs.proto.lineinfo.pop();
                return self.cond_jump(
                    OpCode::Test,
                    Instruction::b(ie),
                    0,
                    if cond { 0 } else { 1 },
                );
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        self.cond_jump(
            OpCode::TestSet,
            Instruction::NO_REG,
            e.info,
            if cond { 1 } else { 0 },
        )
    }

    /// Arrange for control to continue here when `e` is true.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::K | ExpKind::KInt | ExpKind::KFlt | ExpKind::True => NO_JUMP,
            ExpKind::Jmp => {
                self.invert_jump(e);
                e.info as i32
            }
            _ => self.jump_on_cond(e, false)?,
        };
        let mut f = e.f;
        self.concat_jump(&mut f, pc)?;
        e.f = f;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            ExpKind::Jmp => e.info as i32,
            _ => self.jump_on_cond(e, true)?,
        };
        let mut t = e.t;
        self.concat_jump(&mut t, pc)?;
        e.t = t;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil | ExpKind::False => {
                e.kind = ExpKind::True;
            }
            ExpKind::K | ExpKind::KInt | ExpKind::KFlt | ExpKind::True => {
                e.kind = ExpKind::False;
            }
            ExpKind::Jmp => {
                self.invert_jump(e);
            }
            ExpKind::Reloc | ExpKind::NonReloc => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                e.info = self.emit_abc(OpCode::Not, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
            }
            _ => unreachable!(),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    // ===== Operators =====

    fn binop_to_arith(op: BinOp) -> Option<ArithOp> {
        Some(match op {
            BinOp::Add => ArithOp::Add,
            BinOp::Sub => ArithOp::Sub,
            BinOp::Mul => ArithOp::Mul,
            BinOp::Mod => ArithOp::Mod,
            BinOp::Pow => ArithOp::Pow,
            BinOp::Div => ArithOp::Div,
            BinOp::IDiv => ArithOp::IDiv,
            BinOp::BAnd => ArithOp::BAnd,
            BinOp::BOr => ArithOp::BOr,
            BinOp::BXor => ArithOp::BXor,
            BinOp::Shl => ArithOp::Shl,
            BinOp::Shr => ArithOp::Shr,
            _ => return None,
        })
    }

    fn binop_to_opcode(op: BinOp) -> OpCode {
        match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            BinOp::Div => OpCode::Div,
            BinOp::IDiv => OpCode::IDiv,
            BinOp::BAnd => OpCode::BAnd,
            BinOp::BOr => OpCode::BOr,
            BinOp::BXor => OpCode::BXor,
            BinOp::Shl => OpCode::Shl,
            BinOp::Shr => OpCode::Shr,
            _ => unreachable!("not an arithmetic operator"),
        }
    }

    fn exp_value(e: &ExpDesc) -> Value {
        match e.kind {
            ExpKind::KInt => Value::Int(e.ival),
            ExpKind::KFlt => Value::Float(e.nval),
            _ => Value::Nil,
        }
    }

    /// Fold arithmetic between two numeral operands at compile time.
    /// Folding is abandoned when the raw operation fails (division by
    /// zero, inexact bitwise operand) so the error surfaces at runtime.
    fn try_fold(&mut self, op: ArithOp, e1: &ExpDesc, e2: &ExpDesc) -> Option<ExpDesc> {
        if !e1.is_numeral() || !e2.is_numeral() {
            return None;
        }
        let v = raw_arith(op, Self::exp_value(e1), Self::exp_value(e2))?;
        match v {
            Value::Int(i) => Some(ExpDesc::int(i)),
            // NaN and zero floats are not folded: zero would lose the sign
            // of -0.0 through constant dedup.
            Value::Float(f) if !f.is_nan() && f != 0.0 => Some(ExpDesc::float(f)),
            _ => None,
        }
    }

    fn code_arith(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LuaResult<()> {
        let aop = Self::binop_to_arith(op).expect("arith operator");
        if let Some(folded) = self.try_fold(aop, e1, e2) {
            *e1 = folded;
            return Ok(());
        }
        let o2 = self.exp_to_rk(e2)?;
        let o1 = self.exp_to_rk(e1)?;
        if o1 > o2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
        e1.info = self.emit_abc(Self::binop_to_opcode(op), 0, o1, o2) as u32;
        e1.kind = ExpKind::Reloc;
        self.fix_line(line);
        Ok(())
    }

    fn code_comp(&mut self, op: BinOp, e1: &mut ExpDesc, e2: &mut ExpDesc) -> LuaResult<()> {
        let mut o1 = self.exp_to_rk(e1)?;
        let mut o2 = self.exp_to_rk(e2)?;
        self.free_exp(e2);
        self.free_exp(e1);
        let (cond, opc, swap) = match op {
            BinOp::Ne => (0, OpCode::Eq, false),
            BinOp::Eq => (1, OpCode::Eq, false),
            BinOp::Lt => (1, OpCode::Lt, false),
            BinOp::Le => (1, OpCode::Le, false),
            BinOp::Gt => (1, OpCode::Lt, true),
            BinOp::Ge => (1, OpCode::Le, true),
            _ => unreachable!("not a comparison"),
        };
        if swap {
            std::mem::swap(&mut o1, &mut o2);
        }
        e1.info = self.cond_jump(opc, cond, o1, o2)? as u32;
        e1.kind = ExpKind::Jmp;
        Ok(())
    }

    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> LuaResult<()> {
        match op {
            UnOp::Minus => {
                if e.is_numeral() {
                    if let Some(v) =
                        raw_arith(ArithOp::Unm, Self::exp_value(e), Value::Nil)
                    {
                        *e = match v {
                            Value::Int(i) => ExpDesc::int(i),
                            Value::Float(f) => ExpDesc::float(f),
                            _ => unreachable!(),
                        };
                        return Ok(());
                    }
                }
                self.exp_to_any_reg(e)?;
                self.free_exp(e);
                e.info = self.emit_abc(OpCode::Unm, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
                self.fix_line(line);
            }
            UnOp::BNot => {
                if e.is_numeral() {
                    if let Some(Value::Int(i)) =
                        raw_arith(ArithOp::BNot, Self::exp_value(e), Value::Nil)
                    {
                        *e = ExpDesc::int(i);
                        return Ok(());
                    }
                }
                self.exp_to_any_reg(e)?;
                self.free_exp(e);
                e.info = self.emit_abc(OpCode::BNot, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
                self.fix_line(line);
            }
            UnOp::Not => {
                self.code_not(e)?;
            }
            UnOp::Len => {
                self.exp_to_any_reg(e)?;
                self.free_exp(e);
                e.info = self.emit_abc(OpCode::Len, 0, e.info, 0) as u32;
                e.kind = ExpKind::Reloc;
                self.fix_line(line);
            }
        }
        Ok(())
    }

    /// Left-operand preparation before the right side is parsed.
    pub fn infix(&mut self, op: BinOp, e: &mut ExpDesc) -> LuaResult<()> {
        match op {
            BinOp::And => self.go_if_true(e),
            BinOp::Or => self.go_if_false(e),
            BinOp::Concat => self.exp_to_next_reg(e),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.exp_to_rk(e)?;
                Ok(())
            }
            _ => {
                if !e.is_numeral() {
                    self.exp_to_rk(e)?;
                }
                Ok(())
            }
        }
    }

    pub fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LuaResult<()> {
        match op {
            BinOp::And => {
                debug_assert!(e1.t == NO_JUMP);
                self.discharge_vars(e2);
                let mut f = e2.f;
                self.concat_jump(&mut f, e1.f)?;
                e2.f = f;
                *e1 = *e2;
            }
            BinOp::Or => {
                debug_assert!(e1.f == NO_JUMP);
                self.discharge_vars(e2);
                let mut t = e2.t;
                self.concat_jump(&mut t, e1.t)?;
                e2.t = t;
                *e1 = *e2;
            }
            BinOp::Concat => {
                self.exp_to_val(e2)?;
                let prev_concat = e2.kind == ExpKind::Reloc
                    && Instruction::opcode(self.fs().proto.code[e2.info as usize])
                        == OpCode::Concat;
                if prev_concat {
                    // Merge into the run: CONCAT is right-associative and
                    // coalesces whole register spans.
                    debug_assert!(
                        e1.info
                            == Instruction::b(self.fs().proto.code[e2.info as usize]) - 1
                    );
                    self.free_exp(e1);
                    let e1_info = e1.info;
                    let fs = self.fs_mut();
                    Instruction::set_b(&mut fs.proto.code[e2.info as usize], e1_info);
                    e1.kind = ExpKind::Reloc;
                    e1.info = e2.info;
                } else {
                    self.exp_to_next_reg(e2)?;
                    self.free_exp(e2);
                    self.free_exp(e1);
                    e1.info =
                        self.emit_abc(OpCode::Concat, 0, e1.info, e2.info) as u32;
                    e1.kind = ExpKind::Reloc;
                    self.fix_line(line);
                }
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.code_comp(op, e1, e2)?;
            }
            _ => {
                self.code_arith(op, e1, e2, line)?;
            }
        }
        Ok(())
    }

    // ===== Table constructor support =====

    pub fn emit_setlist(&mut self, base: u32, nelems: u32, tostore: i32) -> LuaResult<()> {
        let c = (nelems - 1) / crate::lua_vm::LFIELDS_PER_FLUSH + 1;
        let b = if tostore == -1 { 0 } else { tostore as u32 };
        if c <= Instruction::MAX_C {
            self.emit_abc(OpCode::SetList, base, b, c);
        } else if c <= Instruction::MAX_AX {
            self.emit_abc(OpCode::SetList, base, b, 0);
            let line = self.lex.lastline;
            self.emit(Instruction::ax_op(OpCode::ExtraArg, c), line);
        } else {
            return Err(self.syntax_error("constructor too long"));
        }
        self.fs_mut().freereg = (base + 1) as u8;
        Ok(())
    }
}
