//! Function prologue detection.
//!
//! A linear decoder walks the buffer and matches the short instruction
//! sequences compilers emit at function entry. A one-instruction window
//! `prev` enables the two-instruction patterns and the boundary predicate:
//! a position is a plausible entry when there is no previous instruction or
//! the previous instruction was a RET. RET is a cheap proxy for the gap
//! between functions; it misses tail-call-terminated functions but keeps
//! the false-positive rate acceptable on production binaries.

use anyhow::Result;
use log::debug;
use serde::Serialize;

use crate::{
    analysis::dis::{self, Inst, Op, Operand, Reg},
    arch::Arch,
    VA,
};

/// The shape of instruction sequence found at a function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrologueKind {
    /// `push rbp; mov rbp, rsp`
    Classic,
    /// `sub rsp, imm` without frame pointer setup.
    NoFramePointer,
    /// a bare `push rbp`.
    PushOnly,
    /// `lea rsp, [...]` stack adjustment.
    LeaBased,
    /// `stp x29, x30, [sp, #-16]!; mov x29, sp`
    StpFramePair,
    /// the store-pair without the frame pointer move.
    StpOnly,
    /// `sub sp, sp, #imm`
    SubSp,
}

/// A detected function prologue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prologue {
    pub address: VA,
    #[serde(rename = "type")]
    pub kind: PrologueKind,
    pub instructions: String,
}

/// Detect function prologues in raw machine code. `base_addr` is the
/// virtual address of the first byte of `code`.
pub fn detect_prologues(code: &[u8], base_addr: VA, arch: Arch) -> Result<Vec<Prologue>> {
    let prologues = match arch {
        Arch::Amd64 => detect_prologues_amd64(code, base_addr)?,
        Arch::Arm64 => detect_prologues_arm64(code, base_addr)?,
    };

    debug!("{arch} prologues: {}", prologues.len());
    Ok(prologues)
}

fn at_boundary(prev: Option<&(VA, Inst)>) -> bool {
    match prev {
        None => true,
        Some((_, inst)) => inst.op == Op::Ret,
    }
}

fn is_push_rbp(inst: &Inst) -> bool {
    inst.op == Op::Push && matches!(inst.operands.first(), Some(Operand::Reg(Reg::Rbp)))
}

fn detect_prologues_amd64(code: &[u8], base_addr: VA) -> Result<Vec<Prologue>> {
    let mut result = vec![];
    let mut prev: Option<(VA, Inst)> = None;

    for (offset, inst) in dis::amd64::linear_scan(code)? {
        let Some(inst) = inst else {
            // undecodable bytes: resume at the next offset with the window reset.
            prev = None;
            continue;
        };
        let addr = base_addr + offset as VA;

        // push rbp; mov rbp, rsp
        if let Some((prev_addr, p)) = &prev {
            if is_push_rbp(p)
                && inst.op == Op::Mov
                && matches!(
                    inst.operands.as_slice(),
                    [Operand::Reg(Reg::Rbp), Operand::Reg(Reg::Rsp)]
                )
            {
                result.push(Prologue {
                    address: *prev_addr,
                    kind: PrologueKind::Classic,
                    instructions: "push rbp; mov rbp, rsp".to_string(),
                });
            }
        }

        // sub rsp, imm
        if inst.op == Op::Sub && at_boundary(prev.as_ref()) {
            if let [Operand::Reg(Reg::Rsp), Operand::Imm(imm)] = inst.operands.as_slice() {
                if *imm > 0 {
                    result.push(Prologue {
                        address: addr,
                        kind: PrologueKind::NoFramePointer,
                        instructions: format!("sub rsp, {imm:#x}"),
                    });
                }
            }
        }

        // push rbp as the first instruction. when the next instruction
        // completes the classic pair, a Classic record is emitted for the
        // same address on the following iteration; consumers of the fused
        // candidate list never see the duplicate because fusion keys by
        // address.
        if is_push_rbp(&inst) && at_boundary(prev.as_ref()) {
            result.push(Prologue {
                address: addr,
                kind: PrologueKind::PushOnly,
                instructions: "push rbp".to_string(),
            });
        }

        // lea rsp, [...]
        if inst.op == Op::Lea
            && matches!(inst.operands.first(), Some(Operand::Reg(Reg::Rsp)))
            && at_boundary(prev.as_ref())
        {
            result.push(Prologue {
                address: addr,
                kind: PrologueKind::LeaBased,
                instructions: "lea rsp, [rsp-offset]".to_string(),
            });
        }

        prev = Some((addr, inst));
    }

    Ok(result)
}

fn is_mov_fp_sp(inst: &Inst) -> bool {
    inst.op == Op::Mov
        && matches!(
            inst.operands.as_slice(),
            [Operand::Reg(Reg::X29), Operand::Reg(Reg::Sp)]
        )
}

fn detect_prologues_arm64(code: &[u8], base_addr: VA) -> Result<Vec<Prologue>> {
    let mut result = vec![];
    let mut prev: Option<(VA, Inst)> = None;
    let mut scan = dis::arm64::linear_scan(code)?.peekable();

    while let Some((offset, inst)) = scan.next() {
        let Some(inst) = inst else {
            prev = None;
            continue;
        };
        let addr = base_addr + offset as VA;

        // stp x29, x30, [sp, #-imm]!
        if inst.op == Op::Stp {
            if let [Operand::Reg(Reg::X29), Operand::Reg(Reg::X30), Operand::Mem {
                base: Reg::Sp,
                disp,
                ..
            }] = inst.operands.as_slice()
            {
                if *disp < 0 {
                    let store = format!("stp x29, x30, [sp, #{disp}]!");
                    // the pair is a full frame setup only when the next word
                    // moves sp into the frame pointer.
                    if matches!(scan.peek(), Some((_, Some(next))) if is_mov_fp_sp(next)) {
                        result.push(Prologue {
                            address: addr,
                            kind: PrologueKind::StpFramePair,
                            instructions: format!("{store}; mov x29, sp"),
                        });
                    } else {
                        result.push(Prologue {
                            address: addr,
                            kind: PrologueKind::StpOnly,
                            instructions: store,
                        });
                    }
                }
            }
        }

        // sub sp, sp, #imm
        if inst.op == Op::Sub && at_boundary(prev.as_ref()) {
            if let [Operand::Reg(Reg::Sp), Operand::Reg(Reg::Sp), Operand::Imm(imm)] =
                inst.operands.as_slice()
            {
                if *imm > 0 {
                    result.push(Prologue {
                        address: addr,
                        kind: PrologueKind::SubSp,
                        instructions: format!("sub sp, sp, #{imm:#x}"),
                    });
                }
            }
        }

        prev = Some((addr, inst));
    }

    Ok(result)
}
