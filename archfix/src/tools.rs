//! Short-lived introspection tool invocations.
//!
//! Classification and host probing run small tools and read their output.
//! These do not go through the supervisor: they are quick, read-only, and
//! must stay available while a long-running operation holds the slot.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Captured result of a tool run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutput {
    /// Exit code, `None` if terminated by a signal.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl ToolOutput {
    /// Exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs a program to completion and captures its output.
pub trait ToolRunner: Send + Sync {
    /// Run `program` with `args`.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the program cannot be started. A
    /// non-zero exit is not an error at this level.
    fn run(&self, program: &Path, args: &[&OsStr]) -> io::Result<ToolOutput>;
}

/// [`ToolRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, program: &Path, args: &[&OsStr]) -> io::Result<ToolOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(program = %program.display(), code = ?result.code, "Tool finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_runner_captures_stdout_and_code() {
        let out = SystemToolRunner
            .run(
                Path::new("sh"),
                &[OsStr::new("-c"), OsStr::new("echo arm64; exit 2")],
            )
            .unwrap();
        assert_eq!(out.stdout.trim(), "arm64");
        assert_eq!(out.code, Some(2));
        assert!(!out.success());
    }

    #[test]
    fn test_system_runner_spawn_failure_is_error() {
        assert!(SystemToolRunner
            .run(Path::new("/nonexistent/archfix-file"), &[])
            .is_err());
    }
}
