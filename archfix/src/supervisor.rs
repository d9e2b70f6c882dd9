//! Single-flight supervisor for external operations.
//!
//! At most one externally spawned operation (architecture thinning,
//! installation tree copy) is active at any time. A second [`start`]
//! while one is in flight is rejected immediately, never queued.
//!
//! # Locking
//!
//! One lock guards the active slot. [`start`] checks and claims the slot
//! and spawns the child in a single critical section, then blocks its
//! caller until the child exits. The slot stays claimed for the whole
//! run; the blocked caller re-acquires the lock only briefly to poll the
//! child, so [`stop`] and [`state`] can reach the running child.
//!
//! [`start`]: ProcessSupervisor::start
//! [`stop`]: ProcessSupervisor::stop
//! [`state`]: ProcessSupervisor::state

use archfix_common::consts::{CHILD_POLL_INTERVAL, STOP_GRACE_PERIOD};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A program plus arguments to run under supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpec {
    /// Command running `program` with no arguments.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Program path or name.
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

fn poll_child(active: &mut ActiveProcess) -> Result<Option<ExitStatus>, SupervisorError> {
    let pid = active.child.id();
    active
        .child
        .try_wait()
        .map_err(|source| SupervisorError::Wait { pid, source })
}

/// Snapshot returned by [`ProcessSupervisor::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorState {
    /// An operation is in flight.
    pub is_running: bool,
    /// The supervisor accepts work (not yet shut down).
    pub initialized: bool,
}

/// How a [`ProcessSupervisor::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running.
    Idle,
    /// The child had exited before any signal was sent.
    AlreadyExited,
    /// The child exited on SIGTERM within the grace period.
    Terminated,
    /// The grace period elapsed and the child was killed.
    Killed,
}

/// Error type for supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Single-flight violation.
    #[error("an operation is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// The supervisor was shut down and no longer accepts work.
    #[error("supervisor has been shut down")]
    ShutDown,

    /// The command could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Polling or reaping the child failed.
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Delivering a signal failed.
    #[error("failed to send {signal:?} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },

    /// The operation was ended by `stop` before it completed.
    #[error("{command} was stopped before completion")]
    Interrupted {
        command: String,
        status: Option<ExitStatus>,
    },
}

struct ActiveProcess {
    child: Child,
    generation: u64,
    command: String,
}

/// How an operation ended when someone other than its `start` caller
/// observed the exit.
struct Finished {
    status: Option<ExitStatus>,
    stopped: bool,
}

struct Slot {
    active: Option<ActiveProcess>,
    /// Keyed by generation; each entry is claimed by its blocked `start`.
    finished: HashMap<u64, Finished>,
    generation: u64,
    initialized: bool,
}

impl Slot {
    /// Non-blocking liveness check; clears the slot if the child exited.
    fn reap_if_exited(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.child.try_wait() {
            Ok(Some(status)) => {
                info!(pid = active.child.id(), %status, "Operation has completed, clearing state");
                self.finished.insert(
                    active.generation,
                    Finished {
                        status: Some(status),
                        stopped: false,
                    },
                );
                self.active = None;
            }
            Ok(None) => {}
            Err(e) => warn!(pid = active.child.id(), "Liveness poll failed: {e}"),
        }
    }
}

/// Owns the single active-operation slot.
///
/// Create one per service, share it behind an `Arc`, and call
/// [`shutdown`](Self::shutdown) when the service stops.
pub struct ProcessSupervisor {
    slot: Mutex<Slot>,
    grace: Duration,
    poll_interval: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Supervisor with the standard 5 second stop grace period.
    pub fn new() -> Self {
        Self::with_grace(STOP_GRACE_PERIOD)
    }

    /// Supervisor with a custom SIGTERM-to-SIGKILL grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot {
                active: None,
                finished: HashMap::new(),
                generation: 0,
                initialized: true,
            }),
            grace,
            poll_interval: CHILD_POLL_INTERVAL,
        }
    }

    /// Run `command` to completion.
    ///
    /// Blocks the caller for the whole run. Returns the child's exit
    /// status, whatever it is; callers decide what a non-zero exit means.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if another operation holds the slot (no spawn)
    /// - `ShutDown` after [`shutdown`](Self::shutdown)
    /// - `Spawn` if the program cannot be started; the slot stays free
    /// - `Interrupted` if [`stop`](Self::stop) ended the run
    pub fn start(&self, command: &CommandSpec) -> Result<ExitStatus, SupervisorError> {
        let generation = {
            let mut slot = self.slot.lock();
            if !slot.initialized {
                return Err(SupervisorError::ShutDown);
            }
            slot.reap_if_exited();
            if let Some(active) = &slot.active {
                let pid = active.child.id();
                debug!(pid, %command, "Rejecting start: operation already running");
                return Err(SupervisorError::AlreadyRunning { pid });
            }

            let child = command.to_command().spawn().map_err(|source| {
                error!(%command, "Failed to spawn: {source}");
                SupervisorError::Spawn {
                    command: command.to_string(),
                    source,
                }
            })?;

            slot.generation += 1;
            let generation = slot.generation;
            info!(pid = child.id(), %command, "Started supervised operation");
            slot.active = Some(ActiveProcess {
                child,
                generation,
                command: command.to_string(),
            });
            generation
        };

        loop {
            {
                let mut slot = self.slot.lock();
                let ours = slot
                    .active
                    .as_ref()
                    .is_some_and(|a| a.generation == generation);

                if !ours {
                    return Self::claim_finished(&mut slot, generation, command);
                }

                if let Some(active) = slot.active.as_mut() {
                    match active.child.try_wait() {
                        Ok(Some(status)) => {
                            info!(pid = active.child.id(), %status, "Supervised operation exited");
                            slot.active = None;
                            return Ok(status);
                        }
                        Ok(None) => {}
                        Err(source) => {
                            let pid = active.child.id();
                            error!(pid, "Failed to poll child, killing it: {source}");
                            let _ = active.child.kill();
                            let _ = active.child.wait();
                            slot.active = None;
                            return Err(SupervisorError::Wait { pid, source });
                        }
                    }
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// The run identified by `generation` was cleared by `stop` or `state`.
    fn claim_finished(
        slot: &mut Slot,
        generation: u64,
        command: &CommandSpec,
    ) -> Result<ExitStatus, SupervisorError> {
        match slot.finished.remove(&generation) {
            Some(Finished {
                status: Some(status),
                stopped: false,
            }) => Ok(status),
            Some(f) => Err(SupervisorError::Interrupted {
                command: command.to_string(),
                status: f.status,
            }),
            None => Err(SupervisorError::Interrupted {
                command: command.to_string(),
                status: None,
            }),
        }
    }

    /// Stop the active operation, if any.
    ///
    /// Sends SIGTERM, waits up to the grace period, then SIGKILLs. The
    /// slot is cleared on every path, including errors. Calling this
    /// while idle returns `Ok(StopOutcome::Idle)` and does nothing.
    pub fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let mut slot = self.slot.lock();
        let Some(mut active) = slot.active.take() else {
            debug!("Stop requested with no active operation");
            return Ok(StopOutcome::Idle);
        };

        info!(pid = active.child.id(), command = %active.command, "Attempting to stop operation...");
        let result = self.terminate(&mut active);
        if let Err(e) = &result {
            error!("Error stopping operation: {e}");
            let _ = active.child.kill();
            let _ = active.child.wait();
        }

        slot.finished.insert(
            active.generation,
            Finished {
                status: result.as_ref().ok().and_then(|(_, status)| *status),
                stopped: true,
            },
        );
        info!("Operation state cleared");
        result.map(|(outcome, _)| outcome)
    }

    fn terminate(
        &self,
        active: &mut ActiveProcess,
    ) -> Result<(StopOutcome, Option<ExitStatus>), SupervisorError> {
        let pid = active.child.id();
        if let Some(status) = poll_child(active)? {
            info!(pid, %status, "Operation had already exited");
            return Ok((StopOutcome::AlreadyExited, Some(status)));
        }

        let raw_pid = i32::try_from(pid).map_err(|_| SupervisorError::Signal {
            pid,
            signal: Signal::SIGTERM,
            source: Errno::EINVAL,
        })?;
        match signal::kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => {
                return Err(SupervisorError::Signal {
                    pid,
                    signal: Signal::SIGTERM,
                    source,
                });
            }
        }

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if let Some(status) = poll_child(active)? {
                info!(pid, %status, "Operation terminated successfully");
                return Ok((StopOutcome::Terminated, Some(status)));
            }
            thread::sleep(self.poll_interval);
        }

        warn!(pid, grace = ?self.grace, "Operation did not terminate, forcing kill");
        active
            .child
            .kill()
            .map_err(|source| SupervisorError::Wait { pid, source })?;
        let status = active
            .child
            .wait()
            .map_err(|source| SupervisorError::Wait { pid, source })?;
        Ok((StopOutcome::Killed, Some(status)))
    }

    /// Current state, re-validated against the child's liveness.
    pub fn state(&self) -> SupervisorState {
        let mut slot = self.slot.lock();
        slot.reap_if_exited();
        let state = SupervisorState {
            is_running: slot.active.is_some(),
            initialized: slot.initialized,
        };
        debug!(?state, "Current supervisor state");
        state
    }

    /// Shorthand for `state().is_running`.
    pub fn is_running(&self) -> bool {
        self.state().is_running
    }

    /// Refuse further work and stop whatever is in flight.
    pub fn shutdown(&self) -> Result<StopOutcome, SupervisorError> {
        self.slot.lock().initialized = false;
        info!("Supervisor shutting down");
        self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn wait_until_running(supervisor: &ProcessSupervisor) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !supervisor.is_running() {
            assert!(Instant::now() < deadline, "operation never reported running");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("lipo")
            .arg("-thin")
            .args(["arm64", "/tmp/ffmpeg"]);
        assert_eq!(spec.to_string(), "lipo -thin arm64 /tmp/ffmpeg");
        assert_eq!(spec.program(), Path::new("lipo"));
    }

    #[test]
    fn test_start_returns_exit_status() {
        let supervisor = ProcessSupervisor::new();
        let status = supervisor
            .start(&CommandSpec::new("sh").args(["-c", "exit 3"]))
            .expect("start");
        assert_eq!(status.code(), Some(3));
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_spawn_failure_leaves_slot_free() {
        let supervisor = ProcessSupervisor::new();
        let err = supervisor
            .start(&CommandSpec::new("/nonexistent/archfix-tool"))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }), "got {err:?}");

        let state = supervisor.state();
        assert!(!state.is_running);
        assert!(state.initialized);

        let status = supervisor.start(&CommandSpec::new("true")).expect("start after failure");
        assert!(status.success());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let supervisor = ProcessSupervisor::new();
        assert_eq!(supervisor.stop().unwrap(), StopOutcome::Idle);
        assert_eq!(supervisor.stop().unwrap(), StopOutcome::Idle);
        assert_eq!(
            supervisor.state(),
            SupervisorState {
                is_running: false,
                initialized: true
            }
        );
    }

    #[test]
    fn test_stop_terminates_running_operation() {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let runner = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || supervisor.start(&CommandSpec::new("sleep").arg("30")))
        };
        wait_until_running(&supervisor);

        let started = Instant::now();
        assert_eq!(supervisor.stop().unwrap(), StopOutcome::Terminated);
        assert!(started.elapsed() < STOP_GRACE_PERIOD);
        assert!(!supervisor.is_running());

        let result = runner.join().unwrap();
        assert!(
            matches!(result, Err(SupervisorError::Interrupted { .. })),
            "blocked start should report interruption, got {result:?}"
        );
    }

    #[test]
    fn test_stop_escalates_to_kill_after_grace() {
        let supervisor = Arc::new(ProcessSupervisor::with_grace(Duration::from_millis(200)));
        let runner = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || {
                supervisor.start(&CommandSpec::new("sh").args(["-c", "trap '' TERM; sleep 3"]))
            })
        };
        wait_until_running(&supervisor);
        // Give the shell time to install its trap.
        thread::sleep(Duration::from_millis(200));

        assert_eq!(supervisor.stop().unwrap(), StopOutcome::Killed);
        assert!(!supervisor.is_running());
        assert!(runner.join().unwrap().is_err());
    }

    #[test]
    fn test_state_self_heals_after_exit() {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let runner = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || supervisor.start(&CommandSpec::new("sleep").arg("0.2")))
        };
        wait_until_running(&supervisor);

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.state().is_running {
            assert!(Instant::now() < deadline, "state never observed exit");
            thread::sleep(Duration::from_millis(20));
        }
        let status = runner.join().unwrap().expect("natural exit is not an interruption");
        assert!(status.success());
    }

    #[test]
    fn test_exit_records_are_kept_per_run() {
        let exited = Command::new("true").status().unwrap();
        let mut slot = Slot {
            active: None,
            finished: HashMap::new(),
            generation: 2,
            initialized: true,
        };
        // Run 1 exited on its own; run 2 was stopped before run 1 polled again.
        slot.finished.insert(
            1,
            Finished {
                status: Some(exited),
                stopped: false,
            },
        );
        slot.finished.insert(
            2,
            Finished {
                status: None,
                stopped: true,
            },
        );
        let command = CommandSpec::new("true");

        let first = ProcessSupervisor::claim_finished(&mut slot, 1, &command);
        assert!(first.is_ok_and(|status| status.success()));
        let second = ProcessSupervisor::claim_finished(&mut slot, 2, &command);
        assert!(matches!(second, Err(SupervisorError::Interrupted { status: None, .. })));
        assert!(slot.finished.is_empty());
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let supervisor = ProcessSupervisor::new();
        assert_eq!(supervisor.shutdown().unwrap(), StopOutcome::Idle);
        assert!(!supervisor.state().initialized);
        assert!(matches!(
            supervisor.start(&CommandSpec::new("true")),
            Err(SupervisorError::ShutDown)
        ));
    }
}
