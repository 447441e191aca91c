// Function prototype: the immutable output of the compiler for one
// function body. Closures share prototypes through Rc; nested function
// literals live in `protos`.

use std::rc::Rc;

use crate::gc::StrId;
use crate::lua_value::value::Value;

/// Where an upvalue is captured from, relative to the enclosing function.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: Option<StrId>,
    /// True: captured from an enclosing local (register `idx`).
    /// False: captured from an enclosing upvalue number `idx`.
    pub in_stack: bool,
    pub idx: u8,
}

/// Debug record for one local variable's live range.
#[derive(Debug, Clone)]
pub struct LocVar {
    pub name: StrId,
    pub start_pc: u32,
    pub end_pc: u32,
}

pub struct Proto {
    pub numparams: u8,
    pub is_vararg: bool,
    /// Registers this function's frame needs.
    pub maxstacksize: u8,
    pub code: Vec<u32>,
    /// Restricted to nil/bool/int/float/string.
    pub constants: Vec<Value>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
    pub source: Option<StrId>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    /// Source line per instruction.
    pub lineinfo: Vec<u32>,
    pub locvars: Vec<LocVar>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            numparams: 0,
            is_vararg: false,
            maxstacksize: 2,
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            source: None,
            linedefined: 0,
            lastlinedefined: 0,
            lineinfo: Vec::new(),
            locvars: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lineinfo.get(pc).copied().unwrap_or(0)
    }

    /// Approximate heap footprint for GC accounting.
    pub fn gc_size(&self) -> usize {
        std::mem::size_of::<Proto>()
            + self.code.len() * 4
            + self.constants.len() * std::mem::size_of::<Value>()
            + self.lineinfo.len() * 4
    }

    /// Human-readable instruction listing, for debugging compiler
    /// output. Nested prototypes are listed after their parent.
    pub fn disassemble(&self) -> String {
        use crate::lua_vm::{Instruction, OpMode};
        let mut out = String::new();
        out.push_str(&format!(
            "function <{} params{}, {} slots, {} upvalues, {} constants>\n",
            self.numparams,
            if self.is_vararg { "+" } else { "" },
            self.maxstacksize,
            self.upvalues.len(),
            self.constants.len(),
        ));
        for (pc, &i) in self.code.iter().enumerate() {
            let op = Instruction::opcode(i);
            let line = self.line_at(pc);
            let args = match op.mode() {
                OpMode::IABC => format!(
                    "{} {} {}",
                    Instruction::a(i),
                    Instruction::b(i),
                    Instruction::c(i)
                ),
                OpMode::IABx => format!("{} {}", Instruction::a(i), Instruction::bx(i)),
                OpMode::IAsBx => format!("{} {}", Instruction::a(i), Instruction::sbx(i)),
                OpMode::IAx => format!("{}", Instruction::ax(i)),
            };
            out.push_str(&format!(
                "\t{}\t[{}]\t{}\t{}\n",
                pc + 1,
                line,
                op.name(),
                args
            ));
        }
        for nested in &self.protos {
            out.push('\n');
            out.push_str(&nested.disassemble());
        }
        out
    }
}

impl Default for Proto {
    fn default() -> Self {
        Proto::new()
    }
}
