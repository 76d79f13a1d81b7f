//! AMD64 adapter over the zydis decoder.

use anyhow::Result;

use super::{Inst, Op, Operand, Operands, Reg};
use crate::util;

// ENDBR64 / ENDBR32, the CET landing pads emitted at indirect-branch targets
// on binaries compiled with -fcf-protection. Not every decoder build
// recognizes them, so the scan skips the raw byte patterns up front.
const ENDBR64: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfa];
const ENDBR32: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfb];

fn is_cet_landing_pad(buf: &[u8]) -> bool {
    buf.len() >= 4 && (buf[..4] == ENDBR64 || buf[..4] == ENDBR32)
}

fn get_decoder() -> Result<zydis::Decoder> {
    Ok(zydis::Decoder::new(
        zydis::MachineMode::LONG_64,
        zydis::AddressWidth::_64,
    )?)
}

fn convert_op(mnemonic: zydis::Mnemonic) -> Op {
    match mnemonic {
        zydis::Mnemonic::PUSH => Op::Push,
        zydis::Mnemonic::MOV => Op::Mov,
        zydis::Mnemonic::SUB => Op::Sub,
        zydis::Mnemonic::LEA => Op::Lea,
        zydis::Mnemonic::RET => Op::Ret,
        zydis::Mnemonic::CALL => Op::Call,
        // zydis uses distinct mnemonics for conditional jumps (JZ, JNZ, ...),
        // so JMP is always unconditional.
        zydis::Mnemonic::JMP => Op::Jump,
        _ => Op::Other,
    }
}

fn convert_reg(reg: zydis::Register) -> Reg {
    match reg {
        zydis::Register::NONE => Reg::None,
        zydis::Register::RIP => Reg::Rip,
        zydis::Register::RBP => Reg::Rbp,
        zydis::Register::RSP => Reg::Rsp,
        _ => Reg::Other,
    }
}

fn convert_operand(op: &zydis::DecodedOperand) -> Operand {
    match op.ty {
        zydis::OperandType::REGISTER => Operand::Reg(convert_reg(op.reg)),
        zydis::OperandType::IMMEDIATE => {
            let value = if op.imm.is_signed {
                util::u64_i64(op.imm.value)
            } else {
                op.imm.value as i64
            };
            if op.imm.is_relative {
                Operand::PcRel(value)
            } else {
                Operand::Imm(value)
            }
        }
        zydis::OperandType::MEMORY => Operand::Mem {
            base: convert_reg(op.mem.base),
            index: convert_reg(op.mem.index),
            disp: if op.mem.disp.has_displacement {
                op.mem.disp.displacement
            } else {
                0
            },
        },
        _ => Operand::Other,
    }
}

fn convert(insn: &zydis::DecodedInstruction) -> Inst {
    let operands: Operands = insn
        .operands
        .iter()
        // explicit operands are guaranteed to be first:
        // https://github.com/zyantific/zydis/blob/6a17c48576e1b016ce098c4bdbd001a1403b6a0a/include/Zydis/DecoderTypes.h#L1005-L1007
        .take_while(|op| op.visibility == zydis::OperandVisibility::EXPLICIT)
        .map(convert_operand)
        .collect();

    Inst {
        op: convert_op(insn.mnemonic),
        operands,
        length: insn.length as usize,
    }
}

/// Disassemble the buffer from its start, yielding `(offset, Option<Inst>)`.
///
/// `None` marks a position where decoding failed; the scan resumes one byte
/// later. CET landing pads are consumed transparently and never yielded.
pub fn linear_scan(code: &[u8]) -> Result<impl Iterator<Item = (usize, Option<Inst>)> + '_> {
    let decoder = get_decoder()?;
    let mut offset = 0usize;

    Ok(std::iter::from_fn(move || loop {
        if offset >= code.len() {
            return None;
        }

        if is_cet_landing_pad(&code[offset..]) {
            offset += 4;
            continue;
        }

        let insn_offset = offset;
        return match decoder.decode(&code[insn_offset..]) {
            Ok(Some(insn)) => {
                offset += insn.length as usize;
                Some((insn_offset, Some(convert(&insn))))
            }
            _ => {
                offset += 1;
                Some((insn_offset, None))
            }
        };
    }))
}
