// Expression descriptors: the compiler's stand-in for an AST. An
// expression in progress is a kind plus auxiliary slots whose meaning
// depends on the kind, and two pending jump lists for short-circuit
// evaluation.

pub const NO_JUMP: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpKind {
    /// No value.
    Void,
    Nil,
    True,
    False,
    /// Constant in the constant table (info = index).
    K,
    /// Integer constant (ival).
    KInt,
    /// Float constant (nval).
    KFlt,
    /// Value sits in a fixed register (info = register).
    NonReloc,
    /// Local variable (info = register).
    Local,
    /// Upvalue (info = upvalue index).
    Upval,
    /// Table in a register, key as RK (ind_t, ind_idx).
    Indexed,
    /// Table in an upvalue, key as constant (ind_t, ind_idx).
    IndexUp,
    /// Result of a relational test not yet materialized (info = jump pc).
    Jmp,
    /// Produced by the instruction at info; destination register still
    /// unassigned.
    Reloc,
    /// Open call (info = instruction pc); result count adjustable.
    Call,
    /// Open vararg (info = instruction pc).
    Vararg,
}

#[derive(Debug, Clone, Copy)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// Register, constant index, upvalue index, or instruction pc.
    pub info: u32,
    pub ival: i64,
    pub nval: f64,
    /// Table register or upvalue index for Indexed/IndexUp.
    pub ind_t: u32,
    /// RK-encoded key for Indexed, constant index for IndexUp.
    pub ind_idx: u32,
    /// Patch list: jumps taken when the expression is true.
    pub t: i32,
    /// Patch list: jumps taken when the expression is false.
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        ExpDesc {
            kind,
            info: 0,
            ival: 0,
            nval: 0.0,
            ind_t: 0,
            ind_idx: 0,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn with_info(kind: ExpKind, info: u32) -> Self {
        let mut e = ExpDesc::new(kind);
        e.info = info;
        e
    }

    pub fn int(ival: i64) -> Self {
        let mut e = ExpDesc::new(ExpKind::KInt);
        e.ival = ival;
        e
    }

    pub fn float(nval: f64) -> Self {
        let mut e = ExpDesc::new(ExpKind::KFlt);
        e.nval = nval;
        e
    }

    #[inline(always)]
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    #[inline(always)]
    pub fn is_numeral(&self) -> bool {
        matches!(self.kind, ExpKind::KInt | ExpKind::KFlt)
            && self.t == NO_JUMP
            && self.f == NO_JUMP
    }

    /// Any constant kind without pending jumps.
    #[inline(always)]
    pub fn is_const(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Nil | ExpKind::True | ExpKind::False | ExpKind::K | ExpKind::KInt
                | ExpKind::KFlt
        ) && !self.has_jumps()
    }

    #[inline(always)]
    pub fn is_var(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Local | ExpKind::Upval | ExpKind::Indexed | ExpKind::IndexUp
        )
    }

    /// Open multi-result expression (call or vararg).
    #[inline(always)]
    pub fn has_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call | ExpKind::Vararg)
    }
}

/// Binary operators in precedence-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    BNot,
    Not,
    Len,
}

/// (left, right) binding powers; right < left makes an operator
/// right-associative.
pub fn binop_priority(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (1, 1),
        BinOp::And => (2, 2),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
        BinOp::BOr => (4, 4),
        BinOp::BXor => (5, 5),
        BinOp::BAnd => (6, 6),
        BinOp::Shl | BinOp::Shr => (7, 7),
        BinOp::Concat => (9, 8),
        BinOp::Add | BinOp::Sub => (10, 10),
        BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
        BinOp::Pow => (14, 13),
    }
}

pub const UNARY_PRIORITY: u8 = 12;
