//! Fusion of prologue and call site signals into function candidates.
//!
//! Scoring: a prologue alone is structurally consistent with a function but
//! uncorroborated (medium); a call target alone is common for optimized
//! leaf functions (medium); both signals at the same address upgrade to
//! high. Low-confidence edges are conditional branches, which overwhelmingly
//! point inside function bodies, so they are dropped here; they remain
//! visible to direct consumers of the edge list.

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;
use serde::Serialize;

use crate::{
    analysis::{
        callsite::{self, CallSiteEdge, CallSiteKind, Confidence},
        prologue::{self, Prologue, PrologueKind},
    },
    arch::Arch,
    VA,
};

/// Which signals identified a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionKind {
    PrologueOnly,
    CallTarget,
    JumpTarget,
    Both,
}

/// An address the engine believes begins a function, with evidence and a
/// confidence grade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionCandidate {
    pub address: VA,
    #[serde(rename = "detection_type")]
    pub detection: DetectionKind,
    #[serde(rename = "prologue_type", skip_serializing_if = "Option::is_none")]
    pub prologue_kind: Option<PrologueKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub called_from: Vec<VA>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub jumped_from: Vec<VA>,
    pub confidence: Confidence,
}

/// Detect function entry points by combining prologue detection with call
/// site analysis. `base_addr` is the virtual address of the first byte of
/// `code`.
pub fn detect_functions(code: &[u8], base_addr: VA, arch: Arch) -> Result<Vec<FunctionCandidate>> {
    let prologues = prologue::detect_prologues(code, base_addr, arch)?;
    let edges = callsite::detect_call_sites(code, base_addr, arch)?;

    Ok(fuse(&prologues, &edges))
}

/// Merge the two signal streams into a list of candidates, keyed and sorted
/// by address, at most one candidate per address.
pub fn fuse(prologues: &[Prologue], edges: &[CallSiteEdge]) -> Vec<FunctionCandidate> {
    let mut candidates: BTreeMap<VA, FunctionCandidate> = Default::default();

    for p in prologues {
        // duplicate records at one address (push-only, then the completed
        // classic pair) collapse here; the later record wins.
        candidates.insert(
            p.address,
            FunctionCandidate {
                address: p.address,
                detection: DetectionKind::PrologueOnly,
                prologue_kind: Some(p.kind),
                called_from: vec![],
                jumped_from: vec![],
                confidence: Confidence::Medium,
            },
        );
    }

    for edge in edges.iter().filter(|e| e.confidence >= Confidence::Medium) {
        match candidates.get_mut(&edge.target_addr) {
            Some(candidate) => {
                // an address becomes `Both` only when a prologue is recorded
                // there; a second edge into an edge-only entry appends its
                // backlink and leaves detection and confidence unchanged.
                if candidate.prologue_kind.is_some() {
                    candidate.detection = DetectionKind::Both;
                    candidate.confidence = Confidence::High;
                }
                match edge.kind {
                    CallSiteKind::Call => candidate.called_from.push(edge.source_addr),
                    CallSiteKind::Jump => candidate.jumped_from.push(edge.source_addr),
                }
            }
            None => {
                let (detection, called_from, jumped_from) = match edge.kind {
                    CallSiteKind::Call => {
                        (DetectionKind::CallTarget, vec![edge.source_addr], vec![])
                    }
                    CallSiteKind::Jump => {
                        (DetectionKind::JumpTarget, vec![], vec![edge.source_addr])
                    }
                };
                candidates.insert(
                    edge.target_addr,
                    FunctionCandidate {
                        address: edge.target_addr,
                        detection,
                        prologue_kind: None,
                        called_from,
                        jumped_from,
                        confidence: Confidence::Medium,
                    },
                );
            }
        }
    }

    debug!("function candidates: {}", candidates.len());
    candidates.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::callsite::AddressingMode;
    use crate::test::{arm64_words, encode_call_rel32, encode_jmp_rel32};

    fn edge(source: VA, target: VA, kind: CallSiteKind, confidence: Confidence) -> CallSiteEdge {
        CallSiteEdge {
            source_addr: source,
            target_addr: target,
            kind,
            address_mode: AddressingMode::PcRelative,
            confidence,
        }
    }

    fn prologue(address: VA, kind: PrologueKind) -> Prologue {
        Prologue {
            address,
            kind,
            instructions: String::new(),
        }
    }

    #[test]
    fn corroborated_candidate_upgrades_to_both() {
        // 0x00: push rbp
        // 0x01: mov rbp, rsp
        // 0x04: call 0x20
        // 0x09: ret
        // 0x20: push rbp      <- called from 0x04
        // 0x21: mov rbp, rsp
        // 0x24: ret
        // 0x2f: ret           <- boundary for the next slot
        // 0x30: push rbp      <- never called
        // 0x31: ret
        let mut code = vec![0u8; 0x40];
        code[0x00] = 0x55;
        code[0x01..0x04].copy_from_slice(b"\x48\x89\xe5");
        encode_call_rel32(&mut code, 0x04, 0, 0x20);
        code[0x09] = 0xc3;
        code[0x20] = 0x55;
        code[0x21..0x24].copy_from_slice(b"\x48\x89\xe5");
        code[0x24] = 0xc3;
        code[0x2f] = 0xc3;
        code[0x30] = 0x55;
        code[0x31] = 0xc3;

        let candidates = detect_functions(&code, 0, Arch::Amd64).unwrap();
        let addrs: Vec<VA> = candidates.iter().map(|c| c.address).collect();
        assert_eq!(addrs, vec![0x00, 0x20, 0x30]);

        let at20 = &candidates[1];
        assert_eq!(at20.detection, DetectionKind::Both);
        assert_eq!(at20.confidence, Confidence::High);
        assert_eq!(at20.called_from, vec![0x04]);
        assert_eq!(at20.prologue_kind, Some(PrologueKind::Classic));

        let at30 = &candidates[2];
        assert_eq!(at30.detection, DetectionKind::PrologueOnly);
        assert_eq!(at30.confidence, Confidence::Medium);
    }

    #[test]
    fn jump_target_without_prologue() {
        // 0x00: jmp 0x10
        // 0x10: ret
        let mut code = vec![0u8; 0x20];
        encode_jmp_rel32(&mut code, 0x00, 0, 0x10);
        code[0x10] = 0xc3;

        let candidates = detect_functions(&code, 0, Arch::Amd64).unwrap();
        let at10 = candidates.iter().find(|c| c.address == 0x10).unwrap();
        assert_eq!(at10.detection, DetectionKind::JumpTarget);
        assert_eq!(at10.confidence, Confidence::Medium);
        assert_eq!(at10.jumped_from, vec![0x00]);
        assert!(at10.called_from.is_empty());
    }

    #[test]
    fn arm64_corroboration() {
        // 0x00: stp x29, x30, [sp, #-16]!
        // 0x04: mov x29, sp
        // 0x08: bl 0x20
        // 0x0c: ret
        // 0x10..0x1c: nops
        // 0x20: stp x29, x30, [sp, #-16]!
        // 0x24: mov x29, sp
        // 0x28: ret
        let code = arm64_words(&[
            0xa9bf7bfd,
            0x910003fd,
            0x94000006, // bl $+0x18 -> 0x20
            0xd65f03c0,
            0xd503201f,
            0xd503201f,
            0xd503201f,
            0xd503201f,
            0xa9bf7bfd,
            0x910003fd,
            0xd65f03c0,
        ]);

        let candidates = detect_functions(&code, 0, Arch::Arm64).unwrap();
        let at20 = candidates.iter().find(|c| c.address == 0x20).unwrap();
        assert_eq!(at20.detection, DetectionKind::Both);
        assert_eq!(at20.confidence, Confidence::High);
        assert_eq!(at20.called_from, vec![0x08]);
        assert_eq!(at20.prologue_kind, Some(PrologueKind::StpFramePair));
    }

    #[test]
    fn second_edge_into_bare_target_stays_call_target() {
        let edges = [
            edge(0x10, 0x100, CallSiteKind::Call, Confidence::High),
            edge(0x20, 0x100, CallSiteKind::Call, Confidence::High),
            edge(0x30, 0x100, CallSiteKind::Jump, Confidence::Medium),
        ];
        let candidates = fuse(&[], &edges);

        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        // no prologue at 0x100, so extra edges accumulate backlinks without
        // pretending both signals agreed.
        assert_eq!(c.detection, DetectionKind::CallTarget);
        assert_eq!(c.confidence, Confidence::Medium);
        assert_eq!(c.called_from, vec![0x10, 0x20]);
        assert_eq!(c.jumped_from, vec![0x30]);
    }

    #[test]
    fn low_and_unresolved_edges_are_filtered() {
        let edges = [
            edge(0x10, 0x100, CallSiteKind::Jump, Confidence::Low),
            edge(0x20, 0x200, CallSiteKind::Call, Confidence::None),
        ];
        assert!(fuse(&[], &edges).is_empty());
    }

    #[test]
    fn duplicate_prologues_collapse_by_address() {
        let prologues = [
            prologue(0x40, PrologueKind::PushOnly),
            prologue(0x40, PrologueKind::Classic),
        ];
        let candidates = fuse(&prologues, &[]);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].prologue_kind, Some(PrologueKind::Classic));
        assert_eq!(candidates[0].detection, DetectionKind::PrologueOnly);
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let prologues = [
            prologue(0x300, PrologueKind::Classic),
            prologue(0x100, PrologueKind::Classic),
        ];
        let edges = [
            edge(0x10, 0x200, CallSiteKind::Call, Confidence::High),
            edge(0x20, 0x100, CallSiteKind::Call, Confidence::High),
        ];
        let candidates = fuse(&prologues, &edges);

        let addrs: Vec<VA> = candidates.iter().map(|c| c.address).collect();
        assert_eq!(addrs, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn empty_input() {
        assert!(detect_functions(b"", 0, Arch::Amd64).unwrap().is_empty());
        assert!(detect_functions(b"", 0, Arch::Arm64).unwrap().is_empty());
    }

    #[test]
    fn idempotent() {
        let code = b"\x55\x48\x89\xe5\xe8\x17\x00\x00\x00\xc3";
        assert_eq!(
            detect_functions(code, 0x1000, Arch::Amd64).unwrap(),
            detect_functions(code, 0x1000, Arch::Amd64).unwrap()
        );
    }

    #[test]
    fn serializes_with_stable_field_names() {
        let candidate = FunctionCandidate {
            address: 0x20,
            detection: DetectionKind::Both,
            prologue_kind: Some(PrologueKind::Classic),
            called_from: vec![0x04],
            jumped_from: vec![],
            confidence: Confidence::High,
        };
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            serde_json::json!({
                "address": 0x20,
                "detection_type": "both",
                "prologue_type": "classic",
                "called_from": [0x04],
                "confidence": "high",
            })
        );

        // empty backlinks and a missing prologue kind are omitted.
        let bare = FunctionCandidate {
            address: 0x10,
            detection: DetectionKind::CallTarget,
            prologue_kind: None,
            called_from: vec![0x00],
            jumped_from: vec![],
            confidence: Confidence::Medium,
        };
        let value = serde_json::to_value(&bare).unwrap();
        assert!(value.get("prologue_type").is_none());
        assert!(value.get("jumped_from").is_none());
    }
}
