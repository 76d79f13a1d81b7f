//! Call site detection.
//!
//! A linear decoder walks the buffer and emits an edge for every call or
//! branch of interest. Unlike prologue detection, no boundary state is
//! carried across instructions: every CALL/JMP (AMD64) and BL/B (ARM64) is
//! an edge, resolved when the operand names its destination statically.

use anyhow::Result;
use log::debug;
use serde::Serialize;

use crate::{
    analysis::dis::{self, Inst, Op, Operand, Reg},
    arch::Arch,
    util, VA,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallSiteKind {
    Call,
    Jump,
}

/// How the destination address is specified by the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingMode {
    PcRelative,
    Absolute,
    RegisterIndirect,
}

/// How reliable a detection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

/// A call or jump instruction and the destination it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSiteEdge {
    pub source_addr: VA,
    /// meaningful only when `confidence` is not [`Confidence::None`].
    pub target_addr: VA,
    #[serde(rename = "type")]
    pub kind: CallSiteKind,
    pub address_mode: AddressingMode,
    pub confidence: Confidence,
}

/// Detect call sites in raw machine code. `base_addr` is the virtual
/// address of the first byte of `code`.
pub fn detect_call_sites(code: &[u8], base_addr: VA, arch: Arch) -> Result<Vec<CallSiteEdge>> {
    let edges = match arch {
        Arch::Amd64 => detect_call_sites_amd64(code, base_addr)?,
        Arch::Arm64 => detect_call_sites_arm64(code, base_addr)?,
    };

    debug!("{arch} call sites: {}", edges.len());
    Ok(edges)
}

fn detect_call_sites_amd64(code: &[u8], base_addr: VA) -> Result<Vec<CallSiteEdge>> {
    let mut result = vec![];

    for (offset, inst) in dis::amd64::linear_scan(code)? {
        let Some(inst) = inst else { continue };

        let (kind, base_confidence) = match inst.op {
            Op::Call => (CallSiteKind::Call, Confidence::High),
            // always unconditional; possibly a tail call.
            Op::Jump => (CallSiteKind::Jump, Confidence::Medium),
            _ => continue,
        };

        let source_addr = base_addr + offset as VA;
        if let Some(edge) = classify_amd64(&inst, source_addr, kind, base_confidence) {
            result.push(edge);
        }
    }

    Ok(result)
}

/// Classify the operand of an AMD64 CALL or JMP and resolve its target.
fn classify_amd64(
    inst: &Inst,
    source_addr: VA,
    kind: CallSiteKind,
    base_confidence: Confidence,
) -> Option<CallSiteEdge> {
    let next = source_addr + inst.length as VA;

    match inst.operands.first()? {
        // call/jmp rel8 or rel32.
        Operand::PcRel(disp) => Some(CallSiteEdge {
            source_addr,
            target_addr: util::va_add_signed(next, *disp),
            kind,
            address_mode: AddressingMode::PcRelative,
            confidence: base_confidence,
        }),

        Operand::Mem {
            base: Reg::Rip,
            index: Reg::None,
            disp,
        } => {
            // rip-relative: the dominant indirect form in position
            // independent binaries (PLT/GOT). The referenced slot is
            // `next + disp`; the callee held in it is not statically
            // known, so confidence caps at medium even for CALL.
            Some(CallSiteEdge {
                source_addr,
                target_addr: util::va_add_signed(next, *disp),
                kind,
                address_mode: AddressingMode::PcRelative,
                confidence: Confidence::Medium,
            })
        }

        // call/jmp [disp]: absolute memory address.
        Operand::Mem {
            base: Reg::None,
            index: Reg::None,
            disp,
        } => Some(CallSiteEdge {
            source_addr,
            target_addr: util::i64_u64(*disp),
            kind,
            address_mode: AddressingMode::Absolute,
            confidence: base_confidence,
        }),

        // a register destination, or memory addressing with a register
        // component: not resolvable without emulation.
        Operand::Mem { .. } | Operand::Reg(_) => Some(CallSiteEdge {
            source_addr,
            target_addr: 0,
            kind,
            address_mode: AddressingMode::RegisterIndirect,
            confidence: Confidence::None,
        }),

        _ => None,
    }
}

fn detect_call_sites_arm64(code: &[u8], base_addr: VA) -> Result<Vec<CallSiteEdge>> {
    let mut result = vec![];

    for (offset, inst) in dis::arm64::linear_scan(code)? {
        let Some(inst) = inst else { continue };

        let (kind, confidence) = match inst.op {
            Op::Call => (CallSiteKind::Call, Confidence::High),
            // unconditional B may be a tail call.
            Op::Jump => (CallSiteKind::Jump, Confidence::Medium),
            // B.cond is usually an intra-function branch.
            Op::CondJump => (CallSiteKind::Jump, Confidence::Low),
            _ => continue,
        };

        let source_addr = base_addr + offset as VA;
        match inst.operands.first() {
            Some(Operand::PcRel(disp)) => result.push(CallSiteEdge {
                source_addr,
                target_addr: util::va_add_signed(source_addr, *disp),
                kind,
                address_mode: AddressingMode::PcRelative,
                confidence,
            }),
            // blr/br: the destination lives in a register.
            Some(Operand::Reg(_)) => result.push(CallSiteEdge {
                source_addr,
                target_addr: 0,
                kind,
                address_mode: AddressingMode::RegisterIndirect,
                confidence: Confidence::None,
            }),
            _ => {}
        }
    }

    Ok(result)
}
