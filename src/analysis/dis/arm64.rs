//! ARM64 adapter over the capstone decoder.
//!
//! Capstone resolves branch immediates to absolute addresses during decode.
//! The adapter decodes every word at address zero, so the immediate it
//! reports is exactly the signed displacement and the target arithmetic
//! stays in the detectors.

use anyhow::Result;
use capstone::arch::arm64::{Arm64Insn, Arm64Operand, Arm64OperandType, Arm64Reg, ArchMode};
use capstone::arch::{ArchDetail, DetailsArchInsn};
use capstone::prelude::*;
use capstone::Capstone;

use super::{Inst, Op, Operand, Operands, Reg};

/// instruction word size; the scan never advances by anything else.
const INSN_SIZE: usize = 4;

fn get_decoder() -> Result<Capstone> {
    let decoder = Capstone::new()
        .arm64()
        .mode(ArchMode::Arm)
        .detail(true)
        .build()?;
    Ok(decoder)
}

fn convert_op(id: u32, detail: &capstone::arch::arm64::Arm64InsnDetail) -> Op {
    if id == Arm64Insn::ARM64_INS_BL as u32 || id == Arm64Insn::ARM64_INS_BLR as u32 {
        Op::Call
    } else if id == Arm64Insn::ARM64_INS_B as u32 {
        // a plain B and a B.cond share an instruction id; the condition
        // code field tells them apart.
        if is_conditional(detail) {
            Op::CondJump
        } else {
            Op::Jump
        }
    } else if id == Arm64Insn::ARM64_INS_BR as u32 {
        Op::Jump
    } else if id == Arm64Insn::ARM64_INS_RET as u32 {
        Op::Ret
    } else if id == Arm64Insn::ARM64_INS_STP as u32 {
        Op::Stp
    } else if id == Arm64Insn::ARM64_INS_SUB as u32 {
        Op::Sub
    } else if id == Arm64Insn::ARM64_INS_MOV as u32 {
        Op::Mov
    } else {
        Op::Other
    }
}

fn is_conditional(detail: &capstone::arch::arm64::Arm64InsnDetail) -> bool {
    use capstone::arch::arm64::Arm64CC;

    let cc = detail.cc();
    cc != Arm64CC::ARM64_CC_INVALID && cc != Arm64CC::ARM64_CC_AL && cc != Arm64CC::ARM64_CC_NV
}

fn convert_reg(id: RegId) -> Reg {
    // the fp/lr alias ids share values with x29/x30, so one comparison
    // covers both spellings.
    match u32::from(id.0) {
        0 => Reg::None,
        r if r == Arm64Reg::ARM64_REG_X29 as u32 => Reg::X29,
        r if r == Arm64Reg::ARM64_REG_X30 as u32 => Reg::X30,
        r if r == Arm64Reg::ARM64_REG_SP as u32 => Reg::Sp,
        _ => Reg::Other,
    }
}

fn convert_operand(op: &Arm64Operand) -> Operand {
    match op.op_type {
        Arm64OperandType::Reg(id) => Operand::Reg(convert_reg(id)),
        Arm64OperandType::Imm(value) => Operand::Imm(value),
        Arm64OperandType::Mem(mem) => Operand::Mem {
            base: convert_reg(mem.base()),
            index: convert_reg(mem.index()),
            disp: mem.disp() as i64,
        },
        _ => Operand::Other,
    }
}

fn convert(decoder: &Capstone, insn: &capstone::Insn) -> Option<Inst> {
    let detail = decoder.insn_detail(insn).ok()?;
    let ArchDetail::Arm64Detail(arm64) = detail.arch_detail() else {
        return None;
    };

    let op = convert_op(insn.id().0, &arm64);
    let mut operands: Operands = arm64.operands().map(|o| convert_operand(&o)).collect();

    // branch immediates came back from a decode at address zero,
    // so they are pc-relative displacements.
    if matches!(op, Op::Call | Op::Jump | Op::CondJump) {
        if let Some(Operand::Imm(value)) = operands.first().copied() {
            operands[0] = Operand::PcRel(value);
        }
    }

    Some(Inst {
        op,
        operands,
        length: INSN_SIZE,
    })
}

/// Disassemble the buffer from its start, yielding `(offset, Option<Inst>)`
/// for each 4-byte word. `None` marks a word that failed to decode. A
/// trailing fragment shorter than one word terminates the scan.
pub fn linear_scan(code: &[u8]) -> Result<impl Iterator<Item = (usize, Option<Inst>)> + '_> {
    let decoder = get_decoder()?;
    let mut offset = 0usize;

    Ok(std::iter::from_fn(move || {
        if offset + INSN_SIZE > code.len() {
            return None;
        }

        let insn_offset = offset;
        offset += INSN_SIZE;

        let word = &code[insn_offset..insn_offset + INSN_SIZE];
        let inst = match decoder.disasm_count(word, 0x0, 1) {
            Ok(insns) => insns.iter().next().and_then(|i| convert(&decoder, i)),
            Err(_) => None,
        };

        Some((insn_offset, inst))
    }))
}
