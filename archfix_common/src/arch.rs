//! CPU architecture classification.
//!
//! Every detection path in the workspace produces an [`Architecture`].
//! [`Architecture::Unknown`] is a legitimate terminal value: callers must
//! propagate it instead of substituting a guess.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CPU instruction-set family of a binary or host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 64-bit Intel/AMD.
    #[serde(rename = "x86_64")]
    X86_64,
    /// 64-bit ARM (Apple silicon).
    Arm64,
    /// Could not be classified by any strategy.
    #[default]
    Unknown,
}

impl Architecture {
    /// Canonical lowercase name, as used on the command line and in markers.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Unknown => "unknown",
        }
    }

    /// `true` for the two concrete architectures.
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Scan free-form tool output for an architecture name.
    ///
    /// Matching is case-insensitive and `arm64` is checked before
    /// `x86_64`, so output describing a universal binary that carries
    /// both slices classifies as `arm64`.
    pub fn from_tool_output(output: &str) -> Self {
        let lower = output.to_lowercase();
        if lower.contains("arm64") {
            Self::Arm64
        } else if lower.contains("x86_64") {
            Self::X86_64
        } else {
            Self::Unknown
        }
    }

    /// Normalize a kernel machine identifier (`uname -m`).
    pub fn from_machine(machine: &str) -> Self {
        match machine.trim().to_lowercase().as_str() {
            "x86_64" | "amd64" => Self::X86_64,
            "arm64" | "aarch64" => Self::Arm64,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an architecture name fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized architecture '{0}' (expected x86_64 or arm64)")]
pub struct ParseArchitectureError(pub String);

impl FromStr for Architecture {
    type Err = ParseArchitectureError;

    /// Parses a user-supplied target. `unknown` is accepted so that it can
    /// be rejected with a domain error further down.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseArchitectureError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_output_prefers_arm64() {
        let universal = "Mach-O universal binary with 2 architectures: \
                         [x86_64:Mach-O 64-bit executable x86_64] [arm64]";
        assert_eq!(Architecture::from_tool_output(universal), Architecture::Arm64);
        assert_eq!(
            Architecture::from_tool_output("Mach-O 64-bit executable X86_64"),
            Architecture::X86_64
        );
        assert_eq!(
            Architecture::from_tool_output("ELF 32-bit LSB executable, ARM"),
            Architecture::Unknown
        );
    }

    #[test]
    fn test_machine_normalization() {
        assert_eq!(Architecture::from_machine("x86_64\n"), Architecture::X86_64);
        assert_eq!(Architecture::from_machine("aarch64"), Architecture::Arm64);
        assert_eq!(Architecture::from_machine("arm64"), Architecture::Arm64);
        assert_eq!(Architecture::from_machine("riscv64"), Architecture::Unknown);
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            arch: Architecture,
        }

        let text = toml::to_string(&Wrapper {
            arch: Architecture::X86_64,
        })
        .unwrap();
        assert!(text.contains("\"x86_64\""), "got: {text}");

        let parsed: Wrapper = toml::from_str("arch = \"arm64\"").unwrap();
        assert_eq!(parsed.arch, Architecture::Arm64);
        let parsed: Wrapper = toml::from_str("arch = \"unknown\"").unwrap();
        assert_eq!(parsed.arch, Architecture::Unknown);
    }

    #[test]
    fn test_from_str_rejects_garbage() {
        assert_eq!("ARM64".parse::<Architecture>(), Ok(Architecture::Arm64));
        assert!("ppc".parse::<Architecture>().is_err());
        assert_eq!(Architecture::Unknown.to_string(), "unknown");
    }
}
