//! Minimal canonical instruction view over the per-ISA disassemblers.
//!
//! The detectors only inspect a handful of opcodes, the frame and stack
//! registers, immediates, and pc-relative displacements. The adapters in
//! [`amd64`] and [`arm64`] reduce each library's decoded instruction to this
//! view, so library API differences stay out of the pattern matching.

use smallvec::SmallVec;

pub mod amd64;
pub mod arm64;

/// Opcode identity, reduced to the instructions the detectors inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Push,
    Mov,
    Sub,
    Lea,
    Ret,
    /// CALL on AMD64, BL/BLR on ARM64.
    Call,
    /// unconditional JMP on AMD64, B/BR on ARM64.
    Jump,
    /// B.cond on ARM64. AMD64 conditional jumps decode under their own
    /// mnemonics and map to [`Op::Other`].
    CondJump,
    /// ARM64 store-pair.
    Stp,
    Other,
}

/// Register identity, reduced to the registers the patterns name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    None,
    Rip,
    Rbp,
    Rsp,
    X29,
    X30,
    Sp,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    /// immediate constant, sign-extended.
    Imm(i64),
    /// signed pc-relative displacement: relative to the end of the
    /// instruction on AMD64, to its start on ARM64.
    PcRel(i64),
    /// memory reference, `[base + index*scale + disp]`.
    Mem { base: Reg, index: Reg, disp: i64 },
    /// operand shape the detectors have no use for (far pointers, ...).
    Other,
}

/// most instructions of interest have 1-3 operands, so store them inline.
pub type Operands = SmallVec<[Operand; 4]>;

/// Canonical decoded instruction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub op: Op,
    pub operands: Operands,
    pub length: usize,
}
