//! # archfix
//!
//! Repairs a CPU-architecture mismatch between a media-server installation
//! and its bundled transcoding binary, with reversible backups.
//!
//! # Module Structure
//!
//! - [`supervisor`] - single-flight external process supervisor
//! - [`tools`] - short-lived introspection tool runner
//! - [`host`] - host architecture detection
//! - [`locate`] - finding the binary inside a bundle
//! - [`classify`] - binary architecture classification
//! - [`backup`] - binary backups, snapshots, atomic copies
//! - [`test_mode`] - test-mode marker file
//! - [`installation`] - installation state machine
//! - [`discovery`] - finding installations
//! - [`control`] - control plane and stop-and-rollback
//! - [`error`] - error taxonomy
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         ControlPlane                          │
//! │  ┌──────────────────────────┐     ┌────────────────────────┐  │
//! │  │ InstallationStateMachine │────►│   ProcessSupervisor    │  │
//! │  │  locate / classify /     │     │  (one active child)    │  │
//! │  │  backup / test mode      │     └───────────┬────────────┘  │
//! │  └────────────┬─────────────┘                 │ lipo, cp      │
//! │               │ file, lipo -info              ▼               │
//! │               ▼                         ┌───────────┐         │
//! │        ┌────────────┐                   │ filesystem│         │
//! │        │ ToolRunner │                   └───────────┘         │
//! │        └────────────┘                                         │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod backup;
pub mod classify;
pub mod control;
pub mod discovery;
pub mod error;
pub mod host;
pub mod installation;
pub mod locate;
pub mod supervisor;
pub mod test_mode;
pub mod tools;

// Re-export key types for convenience
pub use crate::control::{ControlPlane, RollbackReport, RollbackTarget};
pub use crate::error::{Artifact, FixError, Rejection};
pub use crate::host::RequestOrigin;
pub use crate::installation::{InstallationState, InstallationStateMachine};
pub use crate::supervisor::{CommandSpec, ProcessSupervisor, StopOutcome, SupervisorError};
