//! Installation state machine.
//!
//! State lives on disk, not in memory. Every operation re-locates the
//! binary and re-reads the backup and marker artifacts, then acts:
//!
//! ```text
//!  Unknown ──locate──► Compatible / Incompatible ──fix──► BackedUp
//!                            │                              ▲
//!                  force-test-mode                       restore
//!                            ▼                              │
//!                        TestMode ──────────restore────► Restored
//! ```
//!
//! Mutating operations on one installation are serialized by a per-path
//! lock. External tools that rewrite files run through the shared
//! [`ProcessSupervisor`], so at most one such operation is in flight.

use archfix_common::arch::Architecture;
use archfix_common::config::{FixerConfig, ToolPaths};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backup::{self, BackupStatus, RestoreSource, SnapshotKind};
use crate::classify::{ArchClassifier, DetectionStrategy};
use crate::error::{Artifact, FixError, Rejection};
use crate::host::{self, HostProbe, RequestOrigin};
use crate::locate;
use crate::supervisor::{CommandSpec, ProcessSupervisor};
use crate::test_mode::{self, MarkerState, TestModeMarker};
use crate::tools::ToolRunner;

/// Per-installation mutual exclusion, keyed by canonical path.
#[derive(Default)]
pub struct InstallationLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl InstallationLocks {
    /// Lock guarding `installation`. Hold its guard for the whole operation.
    ///
    /// Entries nobody holds any more are evicted on each call.
    pub fn lock_for(&self, installation: &Path) -> Arc<Mutex<()>> {
        let key = fs::canonicalize(installation).unwrap_or_else(|_| installation.to_path_buf());
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key).or_default())
    }
}

/// Binary architecture compared to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    /// Same architecture.
    Compatible,
    /// Both known and different.
    Incompatible,
    /// At least one side is unknown.
    Undetermined,
}

impl Compatibility {
    /// Compare `binary` against `host`.
    pub fn of(binary: Architecture, host: Architecture) -> Self {
        if !binary.is_known() || !host.is_known() {
            Self::Undetermined
        } else if binary == host {
            Self::Compatible
        } else {
            Self::Incompatible
        }
    }
}

/// State derived from on-disk artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationState {
    /// Binary not found.
    Unknown,
    /// Binary found, architecture not classifiable.
    Unclassified,
    /// Binary matches the host, no backup taken.
    Compatible,
    /// Binary does not match the host.
    Incompatible,
    /// Binary matches the host and differs from its backup (fixed).
    BackedUp,
    /// Test-mode marker present.
    TestMode,
    /// Binary is byte-identical to its backup.
    Restored,
}

/// Answer to a compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompatibilityReport {
    /// Located binary.
    pub binary: PathBuf,
    /// Binary architecture.
    pub binary_architecture: Architecture,
    /// Strategy that classified the binary.
    pub detected_by: Option<DetectionStrategy>,
    /// Host architecture.
    pub host_architecture: Architecture,
    /// Comparison result.
    pub compatibility: Compatibility,
}

impl fmt::Display for CompatibilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compatibility {
            Compatibility::Compatible => f.write_str("FFMPEG is compatible with your system"),
            _ => write!(
                f,
                "FFMPEG architecture ({}) does not match system architecture ({})",
                self.binary_architecture, self.host_architecture
            ),
        }
    }
}

/// Full picture of one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationReport {
    /// Installation path as given.
    pub installation: PathBuf,
    /// Compatibility, when the binary was found.
    pub compatibility: Option<CompatibilityReport>,
    /// A binary backup exists.
    pub has_backup: bool,
    /// A test-mode marker exists.
    pub test_mode_active: bool,
    /// Derived state.
    pub state: InstallationState,
}

/// What a fix did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    /// Nothing to do.
    AlreadyCompatible,
    /// The binary was replaced.
    Replaced,
}

/// Result of [`InstallationStateMachine::fix`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixReport {
    /// Located binary.
    pub binary: PathBuf,
    /// What happened.
    pub action: FixAction,
    /// Architecture before the fix.
    pub previous_architecture: Architecture,
    /// Architecture now.
    pub architecture: Architecture,
    /// Host architecture the fix targeted.
    pub host_architecture: Architecture,
    /// Backup outcome, when a replacement was needed.
    pub backup: Option<BackupStatus>,
    /// A test-mode marker was removed.
    pub test_mode_cleared: bool,
}

/// Result of [`InstallationStateMachine::restore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Located binary.
    pub binary: PathBuf,
    /// Copy the binary was restored from.
    pub source: RestoreSource,
    /// Architecture after restoring.
    pub architecture: Architecture,
    /// A test-mode marker was removed.
    pub test_mode_cleared: bool,
}

/// Result of [`InstallationStateMachine::force_test_mode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestModeReport {
    /// Located binary.
    pub binary: PathBuf,
    /// Architecture before thinning.
    pub previous_architecture: Architecture,
    /// Requested architecture.
    pub forced_architecture: Architecture,
    /// Host architecture.
    pub host_architecture: Architecture,
    /// Architecture after thinning.
    pub current_architecture: Architecture,
    /// Backup outcome.
    pub backup: BackupStatus,
}

/// Marker and binary disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    /// The marker names a different architecture than the binary has.
    ArchitectureMismatch {
        forced: Architecture,
        current: Architecture,
    },
    /// The marker file exists but cannot be parsed.
    UnreadableMarker { reason: String },
}

/// Result of [`InstallationStateMachine::check_test_mode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestModeStatus {
    /// A marker file exists.
    pub active: bool,
    /// Architecture recorded in the marker.
    pub forced_architecture: Option<Architecture>,
    /// Architecture of the binary now.
    pub current_architecture: Architecture,
    /// Host architecture.
    pub host_architecture: Architecture,
    /// `None` if either architecture is unknown.
    pub is_compatible: Option<bool>,
    /// Set when the marker does not agree with the binary.
    pub inconsistency: Option<Inconsistency>,
}

/// Drives backup, replacement, test mode and restore for installations.
pub struct InstallationStateMachine {
    supervisor: Arc<ProcessSupervisor>,
    classifier: ArchClassifier,
    host: Arc<dyn HostProbe>,
    tools: ToolPaths,
    binary_name: String,
    replacement_binary: Option<PathBuf>,
    locks: InstallationLocks,
}

impl InstallationStateMachine {
    /// State machine sharing `supervisor` with the rest of the service.
    pub fn new(
        config: &FixerConfig,
        supervisor: Arc<ProcessSupervisor>,
        runner: Arc<dyn ToolRunner>,
        host: Arc<dyn HostProbe>,
    ) -> Self {
        Self {
            supervisor,
            classifier: ArchClassifier::new(runner, &config.tools),
            host,
            tools: config.tools.clone(),
            binary_name: config.binary_name.clone(),
            replacement_binary: config.replacement_binary.clone(),
            locks: InstallationLocks::default(),
        }
    }

    /// Locate the binary inside `installation`.
    pub fn locate(&self, installation: &Path) -> Result<PathBuf, FixError> {
        locate::locate_binary(installation, &self.binary_name)
    }

    /// Classify a binary.
    pub fn classify(&self, binary: &Path) -> Result<Architecture, FixError> {
        self.classifier.architecture(binary)
    }

    /// Host architecture for a request from `origin`.
    pub fn host_architecture(&self, origin: RequestOrigin) -> Architecture {
        host::host_architecture(self.host.as_ref(), origin)
    }

    /// Compare the installation's binary with the host.
    pub fn check_compatibility(
        &self,
        installation: &Path,
        origin: RequestOrigin,
    ) -> Result<CompatibilityReport, FixError> {
        let binary = self.locate(installation)?;
        self.compatibility_of(binary, origin)
    }

    fn compatibility_of(
        &self,
        binary: PathBuf,
        origin: RequestOrigin,
    ) -> Result<CompatibilityReport, FixError> {
        let detection = self.classifier.classify(&binary)?;
        let host = self.host_architecture(origin);
        let report = CompatibilityReport {
            compatibility: Compatibility::of(detection.architecture, host),
            binary,
            binary_architecture: detection.architecture,
            detected_by: detection.strategy,
            host_architecture: host,
        };
        info!("{report}");
        Ok(report)
    }

    /// Derive the installation's state from disk.
    ///
    /// A missing binary is reported as [`InstallationState::Unknown`]; only
    /// a missing installation is an error.
    pub fn inspect(
        &self,
        installation: &Path,
        origin: RequestOrigin,
    ) -> Result<InstallationReport, FixError> {
        let binary = match self.locate(installation) {
            Ok(binary) => binary,
            Err(FixError::NotFound {
                what: Artifact::Binary,
                ..
            }) => {
                return Ok(InstallationReport {
                    installation: installation.to_path_buf(),
                    compatibility: None,
                    has_backup: false,
                    test_mode_active: false,
                    state: InstallationState::Unknown,
                });
            }
            Err(e) => return Err(e),
        };

        let has_backup = backup::has_backup(&binary)?;
        let test_mode_active = test_mode::read_marker(&binary)? != MarkerState::Absent;
        let restored = has_backup && self.matches_backup(&binary);
        let report = self.compatibility_of(binary, origin)?;

        let state = if test_mode_active {
            InstallationState::TestMode
        } else if restored {
            InstallationState::Restored
        } else {
            match report.compatibility {
                Compatibility::Incompatible => InstallationState::Incompatible,
                Compatibility::Undetermined => InstallationState::Unclassified,
                Compatibility::Compatible if has_backup => InstallationState::BackedUp,
                Compatibility::Compatible => InstallationState::Compatible,
            }
        };

        Ok(InstallationReport {
            installation: installation.to_path_buf(),
            compatibility: Some(report),
            has_backup,
            test_mode_active,
            state,
        })
    }

    fn matches_backup(&self, binary: &Path) -> bool {
        let backup = backup::backup_path(binary);
        if !backup.exists() {
            return false;
        }
        backup::same_contents(binary, &backup).unwrap_or_else(|e| {
            warn!(binary = %binary.display(), "Could not compare with backup: {e}");
            false
        })
    }

    /// Back up the binary unless a backup exists.
    pub fn ensure_backup(&self, installation: &Path) -> Result<BackupStatus, FixError> {
        let binary = self.locate(installation)?;
        let lock = self.locks.lock_for(installation);
        let _guard = lock.lock();
        backup::ensure_binary_backup(&binary)
    }

    /// Make the binary match the host architecture.
    ///
    /// A compatible binary is left alone and reported as success. An
    /// incompatible one is backed up first (aborting untouched if that
    /// fails), replaced via temp-then-rename, and re-classified. A
    /// replacement that still does not match is rolled back from the
    /// backup.
    pub fn fix(&self, installation: &Path, origin: RequestOrigin) -> Result<FixReport, FixError> {
        let binary = self.locate(installation)?;
        let lock = self.locks.lock_for(installation);
        let _guard = lock.lock();

        let host = self.host_architecture(origin);
        if !host.is_known() {
            return Err(FixError::UnknownArchitecture {
                subject: "host".to_string(),
            });
        }
        let previous = self.classify(&binary)?;
        if !previous.is_known() {
            return Err(FixError::UnknownArchitecture {
                subject: binary.display().to_string(),
            });
        }

        if previous == host {
            info!(binary = %binary.display(), %host, "Binary already compatible, nothing to fix");
            return Ok(FixReport {
                binary,
                action: FixAction::AlreadyCompatible,
                previous_architecture: previous,
                architecture: previous,
                host_architecture: host,
                backup: None,
                test_mode_cleared: false,
            });
        }

        if self.supervisor.is_running() {
            return Err(FixError::AlreadyRunning);
        }

        info!(binary = %binary.display(), from = %previous, to = %host, "Starting compatibility fix...");
        let backup = backup::ensure_binary_backup(&binary)?;
        self.install_replacement(&binary, host)?;

        let architecture = self.classify(&binary)?;
        if architecture != host {
            error!(
                binary = %binary.display(),
                %architecture,
                "Replacement does not match host, rolling back"
            );
            backup::restore_binary(&binary)?;
            return Err(FixError::VerificationFailed {
                path: binary,
                expected: host,
                found: architecture,
            });
        }

        let test_mode_cleared = test_mode::clear_marker(&binary)?;
        backup::discard_pre_test_mode(&binary)?;
        info!(binary = %binary.display(), "Compatibility fix completed successfully");
        Ok(FixReport {
            binary,
            action: FixAction::Replaced,
            previous_architecture: previous,
            architecture,
            host_architecture: host,
            backup: Some(backup),
            test_mode_cleared,
        })
    }

    fn install_replacement(&self, binary: &Path, host: Architecture) -> Result<(), FixError> {
        match &self.replacement_binary {
            Some(source) => {
                if !source.is_file() {
                    return Err(FixError::not_found(Artifact::Replacement, source));
                }
                info!(source = %source.display(), "Installing configured replacement");
                backup::atomic_copy(source, binary)
            }
            None => self.thin_over(&backup::backup_path(binary), host, binary),
        }
    }

    /// Thin `source` to `arch` and rename the result over `binary`.
    fn thin_over(&self, source: &Path, arch: Architecture, binary: &Path) -> Result<(), FixError> {
        let temp = backup::temp_path(binary);
        backup::remove_if_present(&temp)?;

        let command = CommandSpec::new(&self.tools.lipo)
            .arg("-thin")
            .arg(arch.as_str())
            .arg(source)
            .arg("-output")
            .arg(&temp);
        let status = self.supervisor.start(&command).inspect_err(|_| {
            let _ = fs::remove_file(&temp);
        })?;

        if !status.success() || !temp.is_file() {
            let _ = fs::remove_file(&temp);
            return Err(FixError::ExternalTool {
                tool: command.to_string(),
                reason: if status.success() {
                    "produced no output file".to_string()
                } else {
                    format!("exited with {status}")
                },
            });
        }

        let permissions = fs::metadata(binary)
            .map_err(|e| FixError::fs("stat", binary, e))?
            .permissions();
        fs::set_permissions(&temp, permissions).map_err(|e| {
            let _ = fs::remove_file(&temp);
            FixError::fs("set permissions", &temp, e)
        })?;
        backup::commit_temp(&temp, binary)
    }

    /// Undo the last change to the live binary and leave test mode.
    ///
    /// In test mode the binary goes back to the bytes it had just before
    /// test mode was forced. Otherwise the backup is copied over it.
    /// Fails rather than report success with a stale marker on disk.
    pub fn restore(&self, installation: &Path) -> Result<RestoreReport, FixError> {
        let binary = self.locate(installation)?;
        let lock = self.locks.lock_for(installation);
        let _guard = lock.lock();

        let in_test_mode = test_mode::read_marker(&binary)? != MarkerState::Absent;
        let source = if in_test_mode && backup::restore_pre_test_mode(&binary)? {
            RestoreSource::PreTestMode
        } else {
            backup::restore_binary(&binary)?
        };
        let test_mode_cleared = test_mode::clear_marker(&binary)?;
        backup::discard_pre_test_mode(&binary)?;
        let architecture = self.classify(&binary)?;
        info!(binary = %binary.display(), %architecture, "Binary restored");
        Ok(RestoreReport {
            binary,
            source,
            architecture,
            test_mode_cleared,
        })
    }

    /// Deliberately thin the binary to an incompatible `target`.
    ///
    /// # Errors
    ///
    /// `Rejected` when `target` is unknown, equals the host architecture,
    /// or the host architecture is unknown. Nothing is modified then.
    pub fn force_test_mode(
        &self,
        installation: &Path,
        target: Architecture,
    ) -> Result<TestModeReport, FixError> {
        let binary = self.locate(installation)?;
        if !target.is_known() {
            return Err(FixError::Rejected(Rejection::UnsupportedTarget(target)));
        }

        let lock = self.locks.lock_for(installation);
        let _guard = lock.lock();

        let host = self.host_architecture(RequestOrigin::Local);
        if !host.is_known() {
            return Err(FixError::Rejected(Rejection::HostUnknown));
        }
        if target == host {
            warn!(%target, "Refusing to force the host architecture");
            return Err(FixError::Rejected(Rejection::SameAsHost(host)));
        }
        if self.supervisor.is_running() {
            return Err(FixError::AlreadyRunning);
        }

        let previous = self.classify(&binary)?;
        let backup = backup::ensure_binary_backup(&binary)?;

        // Marker goes down before the binary changes and is put back if
        // the thin fails, so a forced binary never sits without one.
        let prior_marker = test_mode::read_marker_text(&binary)?;
        let saved = backup::save_pre_test_mode(&binary)?;
        let undo = |e: FixError| {
            if let Err(u) = test_mode::restore_marker_text(&binary, prior_marker.as_deref()) {
                error!(binary = %binary.display(), "Could not put back test mode marker: {u}");
            }
            if saved == BackupStatus::Created {
                if let Err(u) = backup::discard_pre_test_mode(&binary) {
                    error!(binary = %binary.display(), "Could not remove saved binary: {u}");
                }
            }
            e
        };
        test_mode::write_marker(&binary, &TestModeMarker::now(target, host)).map_err(&undo)?;
        self.thin_over(&backup::backup_path(&binary), target, &binary).map_err(&undo)?;

        let current = self.classify(&binary)?;
        if current != target {
            warn!(%current, %target, "Thinned binary does not classify as the forced architecture");
        }
        info!(binary = %binary.display(), %target, %host, "Test mode enabled");
        Ok(TestModeReport {
            binary,
            previous_architecture: previous,
            forced_architecture: target,
            host_architecture: host,
            current_architecture: current,
            backup,
        })
    }

    /// Report test-mode status, surfacing marker/binary disagreement.
    pub fn check_test_mode(&self, installation: &Path) -> Result<TestModeStatus, FixError> {
        let binary = self.locate(installation)?;
        let marker = test_mode::read_marker(&binary)?;
        let current = self.classify(&binary)?;
        let host = self.host_architecture(RequestOrigin::Local);

        let (active, forced, inconsistency) = match marker {
            MarkerState::Absent => (false, None, None),
            MarkerState::Present(m) => {
                let mismatch = (m.forced_architecture != current).then_some(
                    Inconsistency::ArchitectureMismatch {
                        forced: m.forced_architecture,
                        current,
                    },
                );
                (true, Some(m.forced_architecture), mismatch)
            }
            MarkerState::Unreadable(reason) => {
                (true, None, Some(Inconsistency::UnreadableMarker { reason }))
            }
        };
        if let Some(inconsistency) = &inconsistency {
            warn!(binary = %binary.display(), ?inconsistency, "Test mode marker disagrees with binary");
        }

        let is_compatible = match Compatibility::of(current, host) {
            Compatibility::Compatible => Some(true),
            Compatibility::Incompatible => Some(false),
            Compatibility::Undetermined => None,
        };
        Ok(TestModeStatus {
            active,
            forced_architecture: forced,
            current_architecture: current,
            host_architecture: host,
            is_compatible,
            inconsistency,
        })
    }

    /// Copy the whole installation to a new timestamped sibling directory.
    ///
    /// Refuses to overwrite an existing snapshot of the same name.
    pub fn snapshot(&self, installation: &Path, kind: SnapshotKind) -> Result<PathBuf, FixError> {
        if !installation.is_dir() {
            return Err(FixError::not_found(Artifact::Installation, installation));
        }
        let lock = self.locks.lock_for(installation);
        let _guard = lock.lock();

        let dest = backup::snapshot_dir(installation, kind, chrono::Local::now().naive_local());
        if dest.exists() {
            return Err(FixError::fs(
                "snapshot",
                &dest,
                io::Error::new(io::ErrorKind::AlreadyExists, "snapshot already exists"),
            ));
        }
        self.copy_tree(installation, &dest)?;
        info!(snapshot = %dest.display(), ?kind, "Installation snapshot created");
        Ok(dest)
    }

    /// Replace the installation tree with `snapshot`.
    ///
    /// The current tree is moved aside first and moved back if the copy
    /// fails. A failed copy is still reported as an error.
    pub fn restore_snapshot(&self, installation: &Path, snapshot: &Path) -> Result<(), FixError> {
        if !snapshot.is_dir() {
            return Err(FixError::not_found(Artifact::Snapshot, snapshot));
        }
        let lock = self.locks.lock_for(installation);
        let _guard = lock.lock();

        if self.supervisor.is_running() {
            return Err(FixError::AlreadyRunning);
        }

        let aside = backup::displaced_path(installation);
        if aside.exists() {
            return Err(FixError::fs(
                "move aside",
                &aside,
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "leftover from an interrupted restore",
                ),
            ));
        }
        let displaced = installation.exists();
        if displaced {
            fs::rename(installation, &aside)
                .map_err(|e| FixError::fs("move aside", installation, e))?;
        }

        if let Err(e) = self.copy_tree(snapshot, installation) {
            error!(installation = %installation.display(), "Snapshot restore failed: {e}");
            if displaced {
                fs::rename(&aside, installation)
                    .map_err(|e| FixError::fs("move back", installation, e))?;
            }
            return Err(e);
        }

        if displaced {
            if let Err(e) = fs::remove_dir_all(&aside) {
                warn!(aside = %aside.display(), "Could not remove previous tree: {e}");
            }
        }
        info!(installation = %installation.display(), snapshot = %snapshot.display(), "Installation restored from snapshot");
        Ok(())
    }

    /// Restore the most recent initial-state snapshot.
    pub fn restore_initial_state(&self, installation: &Path) -> Result<PathBuf, FixError> {
        let Some(snapshot) = backup::latest_snapshot(installation, SnapshotKind::Initial)? else {
            let parent = installation.parent().unwrap_or(Path::new("."));
            return Err(FixError::not_found(
                Artifact::Snapshot,
                &parent.join(format!("{}*", SnapshotKind::Initial.prefix())),
            ));
        };
        self.restore_snapshot(installation, &snapshot)?;
        Ok(snapshot)
    }

    /// Copy `src` to `dest` through `<dest>.partial` and a rename.
    ///
    /// `dest` appears only once the copy has completed. A failed or
    /// stopped copy leaves nothing behind.
    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<(), FixError> {
        let partial = backup::partial_path(dest);
        if backup::remove_tree_if_present(&partial)? {
            warn!(partial = %partial.display(), "Removed leftover partial copy");
        }

        let command = CommandSpec::new(&self.tools.copy)
            .arg("-pR")
            .arg(src)
            .arg(&partial);
        let failure = match self.supervisor.start(&command) {
            Ok(status) if status.success() => None,
            Ok(status) => Some(FixError::ExternalTool {
                tool: command.to_string(),
                reason: format!("exited with {status}"),
            }),
            Err(e) => Some(FixError::from(e)),
        };
        if let Some(e) = failure {
            error!(dest = %dest.display(), "Tree copy failed: {e}");
            if let Err(rm) = backup::remove_tree_if_present(&partial) {
                error!("Could not remove partial copy: {rm}");
            }
            return Err(e);
        }

        fs::rename(&partial, dest).map_err(|e| {
            let _ = fs::remove_dir_all(&partial);
            FixError::fs("rename", dest, e)
        })
    }
}
