use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("unsupported architecture: {0}")]
pub struct ParseArchError(String);

/// The instruction set architectures understood by the detectors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// The smallest unit the linear scan advances by when an instruction
    /// fails to decode.
    pub fn min_insn_size(&self) -> usize {
        match self {
            Arch::Amd64 => 1,
            Arch::Arm64 => 4,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::Amd64 => write!(f, "amd64"),
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

impl FromStr for Arch {
    type Err = ParseArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(ParseArchError(other.to_string())),
        }
    }
}
