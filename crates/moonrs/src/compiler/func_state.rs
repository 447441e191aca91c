// Per-function compile state: the prototype under construction plus the
// register allocator, pending-jump bookkeeping, block chain, and the
// constant-deduplication map.

use ahash::RandomState;
use std::collections::HashMap;

use crate::compiler::expdesc::NO_JUMP;
use crate::gc::StrId;
use crate::lua_value::Proto;

/// Hashable stand-in for a constant value; floats key by bit pattern, and
/// integer/float constants never merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Nil,
    True,
    False,
    Int(i64),
    Float(u64),
    Str(StrId),
}

pub struct BlockCnt {
    /// Index of this block's first active label in the parser list.
    pub first_label: usize,
    /// Index of this block's first pending goto.
    pub first_goto: usize,
    /// Active locals outside the block.
    pub nactvar: u8,
    /// Some local in the block is captured by a closure; a close must be
    /// emitted when the block exits.
    pub upval: bool,
    pub is_loop: bool,
}

/// A label or a pending goto ("break" is a goto with a reserved name).
pub struct LabelDesc {
    pub name: StrId,
    /// For labels: target pc. For gotos: pc of the pending JMP.
    pub pc: i32,
    pub line: u32,
    pub nactvar: u8,
}

/// An active local: index of its debug entry in the prototype.
pub struct VarDesc {
    pub name: StrId,
    pub locvar_idx: u32,
}

pub struct FuncState {
    pub proto: Proto,
    pub const_map: HashMap<ConstKey, u32, RandomState>,
    /// pc of the last jump target, to avoid wrong optimizations across
    /// labels.
    pub lasttarget: i32,
    /// List of pending jumps whose target is the next instruction.
    pub jpc: i32,
    /// Active local count; also the low watermark of reserved registers.
    pub nactvar: u8,
    /// First unused register; invariant freereg >= nactvar.
    pub freereg: u8,
    /// Base of this function's slice of the parser's active-var list.
    pub first_local: usize,
    /// Base of this function's slice of the label/goto lists.
    pub first_label: usize,
    pub first_goto: usize,
    pub blocks: Vec<BlockCnt>,
}

impl FuncState {
    pub fn new(source: Option<StrId>, linedefined: u32) -> Self {
        let mut proto = Proto::new();
        proto.source = source;
        proto.linedefined = linedefined;
        FuncState {
            proto,
            const_map: HashMap::with_hasher(RandomState::new()),
            lasttarget: NO_JUMP,
            jpc: NO_JUMP,
            nactvar: 0,
            freereg: 0,
            first_local: 0,
            first_label: 0,
            first_goto: 0,
            blocks: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }

    pub fn block(&self) -> &BlockCnt {
        self.blocks.last().expect("no active block")
    }

    pub fn block_mut(&mut self) -> &mut BlockCnt {
        self.blocks.last_mut().expect("no active block")
    }
}
