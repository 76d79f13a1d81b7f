//! ELF container adapter.
//!
//! Locates the primary code section of a System V ELF64 image, infers the
//! architecture from the header, and hands the raw bytes to the detectors.
//! This is the only module that understands the container format.

use anyhow::Result;
use goblin::elf::header::{EM_AARCH64, EM_X86_64};
use log::debug;
use thiserror::Error;

use crate::{
    analysis::{
        callsite::{self, CallSiteEdge, Confidence},
        functions::{self, FunctionCandidate},
        prologue::{self, Prologue},
    },
    arch::Arch,
    VA,
};

const TEXT_SECTION: &str = ".text";

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("malformed elf image: {0}")]
    ImageParseFailure(String),

    #[error("no {TEXT_SECTION} section found")]
    NoCodeSection,

    #[error("unsupported elf machine: {0:#x}")]
    UnsupportedArch(u16),

    #[error("failed to read {TEXT_SECTION} section contents")]
    IoReadFailure,
}

/// The primary code section of an image: raw bytes and load address.
struct TextSection<'a> {
    code: &'a [u8],
    address: VA,
    size: u64,
    arch: Arch,
}

fn read_text_section(buf: &[u8]) -> Result<TextSection<'_>> {
    let elf = goblin::elf::Elf::parse(buf)
        .map_err(|e| ElfError::ImageParseFailure(e.to_string()))?;

    let arch = match elf.header.e_machine {
        EM_X86_64 => Arch::Amd64,
        EM_AARCH64 => Arch::Arm64,
        machine => return Err(ElfError::UnsupportedArch(machine).into()),
    };

    let shdr = elf
        .section_headers
        .iter()
        .find(|shdr| elf.shdr_strtab.get_at(shdr.sh_name) == Some(TEXT_SECTION))
        .ok_or(ElfError::NoCodeSection)?;

    let code = shdr
        .file_range()
        .and_then(|range| buf.get(range))
        .ok_or(ElfError::IoReadFailure)?;

    debug!(
        "elf: {TEXT_SECTION}: {:#x}-{:#x} ({arch})",
        shdr.sh_addr,
        shdr.sh_addr + shdr.sh_size
    );

    Ok(TextSection {
        code,
        address: shdr.sh_addr,
        size: shdr.sh_size,
        arch,
    })
}

/// Detect function prologues in the `.text` section of an ELF image.
/// The architecture is inferred from the ELF header.
pub fn detect_prologues_from_elf(buf: &[u8]) -> Result<Vec<Prologue>> {
    let text = read_text_section(buf)?;
    prologue::detect_prologues(text.code, text.address, text.arch)
}

/// Detect call sites in the `.text` section of an ELF image, keeping only
/// edges whose target resolves into the section.
pub fn detect_call_sites_from_elf(buf: &[u8]) -> Result<Vec<CallSiteEdge>> {
    let text = read_text_section(buf)?;
    let edges = callsite::detect_call_sites(text.code, text.address, text.arch)?;

    let (start, end) = (text.address, text.address + text.size);
    Ok(edges
        .into_iter()
        .filter(|e| e.confidence != Confidence::None && e.target_addr >= start && e.target_addr < end)
        .collect())
}

/// Detect function candidates in the `.text` section of an ELF image using
/// combined prologue and call site analysis.
pub fn detect_functions_from_elf(buf: &[u8]) -> Result<Vec<FunctionCandidate>> {
    let text = read_text_section(buf)?;
    functions::detect_functions(text.code, text.address, text.arch)
}
