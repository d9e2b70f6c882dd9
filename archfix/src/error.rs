//! Error taxonomy of the installation state machine.

use archfix_common::arch::Architecture;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::supervisor::SupervisorError;

/// Which on-disk artifact was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    /// The installation bundle itself.
    Installation,
    /// The transcoding binary inside the bundle.
    Binary,
    /// `<binary>.backup` and the original-binary copy.
    Backup,
    /// The configured host-compatible replacement binary.
    Replacement,
    /// A whole-installation snapshot directory.
    Snapshot,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Installation => "installation",
            Self::Binary => "binary",
            Self::Backup => "backup",
            Self::Replacement => "replacement binary",
            Self::Snapshot => "snapshot",
        })
    }
}

/// Why a semantically invalid request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// Forcing the host's own architecture would not be incompatible.
    SameAsHost(Architecture),
    /// Only concrete architectures can be forced.
    UnsupportedTarget(Architecture),
    /// The host architecture could not be determined.
    HostUnknown,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameAsHost(arch) => write!(
                f,
                "cannot force {arch}: it matches the host architecture; \
                 select the opposite architecture to simulate incompatibility"
            ),
            Self::UnsupportedTarget(arch) => write!(f, "cannot force architecture {arch}"),
            Self::HostUnknown => f.write_str("host architecture could not be determined"),
        }
    }
}

/// Error type for installation operations.
#[derive(Debug, thiserror::Error)]
pub enum FixError {
    /// Installation, binary, backup or snapshot absent.
    #[error("{what} not found at {}", path.display())]
    NotFound { what: Artifact, path: PathBuf },

    /// The supervisor already runs an operation.
    #[error("another operation is already running")]
    AlreadyRunning,

    /// Semantically invalid request.
    #[error("request rejected: {0}")]
    Rejected(Rejection),

    /// A spawned tool could not run, exited non-zero, or was stopped.
    #[error("{tool} failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// Copy, rename or remove failed.
    #[error("{op} failed for {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No detection strategy recognized the architecture.
    #[error("architecture of {subject} could not be determined")]
    UnknownArchitecture { subject: String },

    /// The installed replacement does not match the host.
    #[error("replacement at {} classifies as {found}, expected {expected}", path.display())]
    VerificationFailed {
        path: PathBuf,
        expected: Architecture,
        found: Architecture,
    },
}

impl FixError {
    pub(crate) fn not_found(what: Artifact, path: &Path) -> Self {
        Self::NotFound {
            what,
            path: path.to_path_buf(),
        }
    }

    pub(crate) fn fs(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// `true` for [`FixError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Stable short name of the error class, for the request layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyRunning => "already_running",
            Self::Rejected(_) => "rejected",
            Self::ExternalTool { .. } | Self::VerificationFailed { .. } => "external_tool_failure",
            Self::Filesystem { .. } => "filesystem_failure",
            Self::UnknownArchitecture { .. } => "unknown",
        }
    }
}

impl From<SupervisorError> for FixError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning { .. } => Self::AlreadyRunning,
            SupervisorError::Spawn { ref command, .. }
            | SupervisorError::Interrupted { ref command, .. } => Self::ExternalTool {
                tool: command.clone(),
                reason: err.to_string(),
            },
            other => Self::ExternalTool {
                tool: "supervisor".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mentions_artifact_and_path() {
        let err = FixError::not_found(Artifact::Binary, Path::new("/Applications/X.app"));
        let msg = err.to_string();
        assert!(msg.contains("binary"), "got: {msg}");
        assert!(msg.contains("/Applications/X.app"), "got: {msg}");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_supervisor_busy_maps_to_already_running() {
        let err: FixError = SupervisorError::AlreadyRunning { pid: 42 }.into();
        assert!(matches!(err, FixError::AlreadyRunning));
    }

    #[test]
    fn test_interrupted_maps_to_tool_failure() {
        let err: FixError = SupervisorError::Interrupted {
            command: "lipo -thin arm64".to_string(),
            status: None,
        }
        .into();
        match err {
            FixError::ExternalTool { tool, reason } => {
                assert_eq!(tool, "lipo -thin arm64");
                assert!(reason.contains("stopped"), "got: {reason}");
            }
            other => panic!("expected ExternalTool, got {other:?}"),
        }
    }

    #[test]
    fn test_rejection_display() {
        let msg = FixError::Rejected(Rejection::SameAsHost(Architecture::Arm64)).to_string();
        assert!(msg.contains("arm64"), "got: {msg}");
        assert_eq!(
            FixError::Rejected(Rejection::HostUnknown).kind(),
            "rejected"
        );
    }
}
