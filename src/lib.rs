//! Static identification of function entry points in compiled executables.
//!
//! Two complementary signals are fused:
//!
//!   - prologue detection: pattern-matching the short instruction sequences
//!     compilers emit at function entry (`push rbp; mov rbp, rsp`,
//!     `stp x29, x30, [sp, #-16]!; mov x29, sp`, ...),
//!   - call site detection: finding CALL/JMP (AMD64) and BL/B (ARM64)
//!     instructions and recording their targets.
//!
//! [`detect_prologues`] and [`detect_call_sites`] analyze raw bytes from a
//! given base address. [`detect_functions`] runs both and merges the streams
//! into a deduplicated, confidence-scored candidate list: an address with a
//! prologue that is also called or jumped to ranks highest. The
//! `*_from_elf` variants extract the `.text` section of an ELF image and
//! infer the architecture from its header.
//!
//! The detectors work on stripped binaries: no symbol table, relocation, or
//! debug information is consulted.

pub mod analysis;
pub mod arch;
pub mod loader;
pub mod util;


/// A virtual address.
pub type VA = u64;

pub use crate::{
    analysis::{
        callsite::{detect_call_sites, AddressingMode, CallSiteEdge, CallSiteKind, Confidence},
        functions::{detect_functions, fuse, DetectionKind, FunctionCandidate},
        prologue::{detect_prologues, Prologue, PrologueKind},
    },
    arch::Arch,
    loader::elf::{
        detect_call_sites_from_elf, detect_functions_from_elf, detect_prologues_from_elf, ElfError,
    },
};
