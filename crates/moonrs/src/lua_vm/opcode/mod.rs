// Opcode set and instruction formats.
//
// 32-bit fixed-width instructions, four encodings:
//   iABC:  [B(9) | C(9) | A(8) | Op(6)]
//   iABx:  [Bx(18)      | A(8) | Op(6)]
//   iAsBx: [sBx(18)     | A(8) | Op(6)]   (excess-K signed)
//   iAx:   [Ax(26)             | Op(6)]
// B and C are RK operands on the instructions that take them: bit 8 set
// selects a constant index instead of a register.

mod instruction;

pub use instruction::{Instruction, LFIELDS_PER_FLUSH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // A B     R[A] := R[B]
    Move = 0,
    // A Bx    R[A] := K[Bx]
    LoadK,
    // A       R[A] := K[extra arg]
    LoadKx,
    // A B C   R[A] := (bool)B; if C, pc++
    LoadBool,
    // A B     R[A..A+B] := nil
    LoadNil,
    // A B     R[A] := U[B]
    GetUpval,
    // A B C   R[A] := U[B][RK[C]]
    GetTabUp,
    // A B C   R[A] := R[B][RK[C]]
    GetTable,
    // A B C   U[A][RK[B]] := RK[C]
    SetTabUp,
    // A B     U[B] := R[A]
    SetUpval,
    // A B C   R[A][RK[B]] := RK[C]
    SetTable,
    // A B C   R[A] := {} (array size B, hash size C; floating point byte)
    NewTable,
    // A B C   R[A+1] := R[B]; R[A] := R[B][RK[C]]
    Self_,
    // A B C   R[A] := RK[B] + RK[C]
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
    // A B     R[A] := -R[B]
    Unm,
    BNot,
    Not,
    Len,
    // A B C   R[A] := R[B] .. ... .. R[C]
    Concat,
    // A sBx   pc += sBx; if A > 0, close upvalues >= R[A-1]
    Jmp,
    // A B C   if (RK[B] == RK[C]) != A then pc++ (next op is a JMP)
    Eq,
    Lt,
    Le,
    // A C     if (bool)R[A] != C then pc++
    Test,
    // A B C   if (bool)R[B] == C then R[A] := R[B] else pc++
    TestSet,
    // A B C   R[A..] := R[A](R[A+1..A+B-1]); C-1 results (0 = multret)
    Call,
    TailCall,
    // A B     return R[A..A+B-2] (B=0: up to top)
    Return,
    // A sBx   R[A] += R[A+2]; if loop continues, pc += sBx, R[A+3] := R[A]
    ForLoop,
    // A sBx   R[A] -= R[A+2]; pc += sBx
    ForPrep,
    // A C     R[A+3..A+2+C] := R[A](R[A+1], R[A+2])
    TForCall,
    // A sBx   if R[A+1] ~= nil then R[A] := R[A+1]; pc += sBx
    TForLoop,
    // A B C   R[A][(C-1)*50 + i] := R[A+i], 1 <= i <= B (C=0: extra arg)
    SetList,
    // A       close all upvalues >= R[A]
    Close,
    // A Bx    R[A] := closure(proto[Bx])
    Closure,
    // A B     R[A..A+B-2] := vararg (B=0: all, up to top)
    Vararg,
    // Ax      extra (larger) argument for the previous instruction
    ExtraArg,
}

pub const NUM_OPCODES: usize = OpCode::ExtraArg as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

impl OpCode {
    pub fn from_u8(op: u8) -> OpCode {
        debug_assert!((op as usize) < NUM_OPCODES);
        // Opcodes come only from the compiler and the chunk loader, both of
        // which validate; out-of-range decodes as ExtraArg.
        if (op as usize) < NUM_OPCODES {
            unsafe { std::mem::transmute::<u8, OpCode>(op) }
        } else {
            OpCode::ExtraArg
        }
    }

    pub fn mode(self) -> OpMode {
        match self {
            OpCode::LoadK | OpCode::LoadKx | OpCode::Closure => OpMode::IABx,
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::TForLoop => OpMode::IAsBx,
            OpCode::ExtraArg => OpMode::IAx,
            _ => OpMode::IABC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadKx => "LOADKX",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetTabUp => "GETTABUP",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTabUp => "SETTABUP",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::Self_ => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Div => "DIV",
            OpCode::IDiv => "IDIV",
            OpCode::BAnd => "BAND",
            OpCode::BOr => "BOR",
            OpCode::BXor => "BXOR",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Unm => "UNM",
            OpCode::BNot => "BNOT",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForCall => "TFORCALL",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Close => "CLOSE",
            OpCode::Closure => "CLOSURE",
            OpCode::Vararg => "VARARG",
            OpCode::ExtraArg => "EXTRAARG",
        }
    }
}
