//! Control plane: the supervisor and state machine wired together.
//!
//! A request layer holds one [`ControlPlane`] for the life of the
//! service. It owns the only [`ProcessSupervisor`], so every supervised
//! operation across all installations shares one slot.

use archfix_common::config::FixerConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::RestoreSource;
use crate::error::FixError;
use crate::host::{HostProbe, SystemHost};
use crate::installation::InstallationStateMachine;
use crate::supervisor::{ProcessSupervisor, StopOutcome, SupervisorError, SupervisorState};
use crate::tools::{SystemToolRunner, ToolRunner};

/// What [`ControlPlane::stop_and_rollback`] restores after stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTarget {
    /// Copy `<binary>.backup` over the live binary.
    Binary,
    /// Replace the installation tree with the latest initial snapshot.
    InitialState,
}

/// Result of [`ControlPlane::stop_and_rollback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// How the in-flight operation ended; `None` if stopping failed.
    pub stopped: Option<StopOutcome>,
    /// What was restored.
    pub target: RollbackTarget,
    /// Backup copy used, for [`RollbackTarget::Binary`].
    pub source: Option<RestoreSource>,
    /// Snapshot used, for [`RollbackTarget::InitialState`].
    pub snapshot: Option<PathBuf>,
}

/// Process-wide entry point for installation operations.
pub struct ControlPlane {
    supervisor: Arc<ProcessSupervisor>,
    machine: InstallationStateMachine,
}

impl ControlPlane {
    /// Control plane over the given runner and host probe.
    pub fn new(
        config: &FixerConfig,
        runner: Arc<dyn ToolRunner>,
        host: Arc<dyn HostProbe>,
    ) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let machine = InstallationStateMachine::new(config, Arc::clone(&supervisor), runner, host);
        Self {
            supervisor,
            machine,
        }
    }

    /// Control plane invoking the real system tools.
    pub fn system(config: &FixerConfig) -> Self {
        let runner: Arc<dyn ToolRunner> = Arc::new(SystemToolRunner);
        let host = Arc::new(SystemHost::new(
            Arc::clone(&runner),
            config.tools.system_profiler.clone(),
        ));
        Self::new(config, runner, host)
    }

    /// Shared supervisor, e.g. for a signal handler.
    pub fn supervisor(&self) -> Arc<ProcessSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// The installation state machine.
    pub fn installation(&self) -> &InstallationStateMachine {
        &self.machine
    }

    /// Current supervisor state.
    pub fn process_state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    /// Stop whatever is running, then restore `installation`.
    ///
    /// The stop always happens first. A stop error is logged and does not
    /// prevent the restore, since the slot is cleared either way.
    pub fn stop_and_rollback(
        &self,
        installation: &Path,
        target: RollbackTarget,
    ) -> Result<RollbackReport, FixError> {
        let stopped = match self.supervisor.stop() {
            Ok(outcome) => {
                info!(?outcome, "Stopped in-flight operation before rollback");
                Some(outcome)
            }
            Err(e) => {
                warn!("Stop before rollback reported an error: {e}");
                None
            }
        };

        let (source, snapshot) = match target {
            RollbackTarget::Binary => (Some(self.machine.restore(installation)?.source), None),
            RollbackTarget::InitialState => {
                (None, Some(self.machine.restore_initial_state(installation)?))
            }
        };
        info!(installation = %installation.display(), ?target, "Rollback complete");

        Ok(RollbackReport {
            stopped,
            target,
            source,
            snapshot,
        })
    }

    /// Stop any in-flight operation and refuse new ones.
    pub fn shutdown(&self) -> Result<StopOutcome, SupervisorError> {
        self.supervisor.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::CommandSpec;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_stop_and_rollback_interrupts_then_restores() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("EmbyServer.app");
        let binary = app.join("Contents/MacOS/ffmpeg");
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, b"original").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        let plane = ControlPlane::system(&FixerConfig::default());
        plane.installation().ensure_backup(&app).unwrap();
        fs::write(&binary, b"half-written").unwrap();

        let supervisor = plane.supervisor();
        let worker = thread::spawn(move || supervisor.start(&CommandSpec::new("sleep").arg("30")));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !plane.process_state().is_running {
            assert!(Instant::now() < deadline, "operation never started");
            thread::sleep(Duration::from_millis(10));
        }

        let report = plane.stop_and_rollback(&app, RollbackTarget::Binary).unwrap();
        assert_eq!(report.stopped, Some(StopOutcome::Terminated));
        assert_eq!(report.source, Some(RestoreSource::Backup));
        assert_eq!(fs::read(&binary).unwrap(), b"original");

        let interrupted = worker.join().unwrap();
        assert!(matches!(interrupted, Err(SupervisorError::Interrupted { .. })));
        assert!(!plane.process_state().is_running);
    }

    #[test]
    fn test_shutdown_reports_not_initialized() {
        let plane = ControlPlane::system(&FixerConfig::default());
        assert_eq!(plane.shutdown().unwrap(), StopOutcome::Idle);
        assert!(!plane.process_state().initialized);
    }
}
