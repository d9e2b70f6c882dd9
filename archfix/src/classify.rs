//! Binary architecture classification.
//!
//! Strategies run in a fixed order and the first recognized answer wins:
//!
//! 1. file-type tool (`file <binary>`)
//! 2. multi-architecture tool (`lipo -info <binary>`)
//! 3. the binary's own banner (`<binary> -version`)
//!
//! A strategy that cannot run or exits non-zero is skipped. When all
//! three are exhausted the result is [`Architecture::Unknown`].

use archfix_common::arch::Architecture;
use archfix_common::config::ToolPaths;
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Artifact, FixError};
use crate::tools::ToolRunner;

/// One way of asking what a binary is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// File-type classification utility.
    FileType,
    /// Fat/universal binary inspection utility.
    MultiArch,
    /// Executing the binary with `-version`.
    VersionBanner,
}

impl DetectionStrategy {
    /// Evaluation order.
    pub const ORDER: [Self; 3] = [Self::FileType, Self::MultiArch, Self::VersionBanner];
}

/// Result of classifying one binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    /// Detected architecture.
    pub architecture: Architecture,
    /// Strategy that produced it; `None` when every strategy was exhausted.
    pub strategy: Option<DetectionStrategy>,
}

/// Runs the detection strategies against binaries.
pub struct ArchClassifier {
    runner: Arc<dyn ToolRunner>,
    file_tool: PathBuf,
    lipo_tool: PathBuf,
}

impl ArchClassifier {
    /// Classifier invoking the tools configured in `tools`.
    pub fn new(runner: Arc<dyn ToolRunner>, tools: &ToolPaths) -> Self {
        Self {
            runner,
            file_tool: tools.file.clone(),
            lipo_tool: tools.lipo.clone(),
        }
    }

    /// Classify `binary`.
    ///
    /// # Errors
    ///
    /// `NotFound` if `binary` does not exist. Tool failures are not
    /// errors; they only move on to the next strategy.
    pub fn classify(&self, binary: &Path) -> Result<Detection, FixError> {
        if !binary.exists() {
            return Err(FixError::not_found(Artifact::Binary, binary));
        }

        for strategy in DetectionStrategy::ORDER {
            let arch = self.run_strategy(strategy, binary);
            if arch.is_known() {
                info!(binary = %binary.display(), ?strategy, %arch, "Classified binary");
                return Ok(Detection {
                    architecture: arch,
                    strategy: Some(strategy),
                });
            }
        }

        warn!(binary = %binary.display(), "Could not determine architecture using any method");
        Ok(Detection {
            architecture: Architecture::Unknown,
            strategy: None,
        })
    }

    /// Shorthand for `classify(binary)?.architecture`.
    pub fn architecture(&self, binary: &Path) -> Result<Architecture, FixError> {
        Ok(self.classify(binary)?.architecture)
    }

    fn run_strategy(&self, strategy: DetectionStrategy, binary: &Path) -> Architecture {
        let (program, args): (&Path, Vec<&OsStr>) = match strategy {
            DetectionStrategy::FileType => (self.file_tool.as_path(), vec![binary.as_os_str()]),
            DetectionStrategy::MultiArch => (
                self.lipo_tool.as_path(),
                vec![OsStr::new("-info"), binary.as_os_str()],
            ),
            DetectionStrategy::VersionBanner => (binary, vec![OsStr::new("-version")]),
        };

        match self.runner.run(program, &args) {
            Ok(output) if output.success() => {
                debug!(?strategy, stdout = %output.stdout.trim(), "Strategy output");
                Architecture::from_tool_output(&output.stdout)
            }
            Ok(output) => {
                debug!(?strategy, code = ?output.code, "Strategy exited unsuccessfully");
                Architecture::Unknown
            }
            Err(e) => {
                debug!(?strategy, program = %program.display(), "Strategy could not run: {e}");
                Architecture::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io;

    /// Answers by program file name; records every call.
    #[derive(Default)]
    struct ScriptedRunner {
        answers: HashMap<String, ToolOutput>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn answer(mut self, program: &str, code: i32, stdout: &str) -> Self {
            self.answers.insert(
                program.to_string(),
                ToolOutput {
                    code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
            self
        }
    }

    impl ToolRunner for ScriptedRunner {
        fn run(&self, program: &Path, _args: &[&OsStr]) -> io::Result<ToolOutput> {
            let name = program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.calls.lock().push(name.clone());
            self.answers
                .get(&name)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name))
        }
    }

    fn classifier(runner: ScriptedRunner) -> (ArchClassifier, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let classifier = ArchClassifier::new(runner.clone(), &ToolPaths::default());
        (classifier, runner)
    }

    fn scratch_binary() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().prefix("ffmpeg").tempfile().unwrap();
        std::fs::write(file.path(), b"binary").unwrap();
        file
    }

    #[test]
    fn test_first_strategy_wins() {
        let binary = scratch_binary();
        let banner_name = binary.path().file_name().unwrap().to_string_lossy().into_owned();
        let (classifier, runner) = classifier(
            ScriptedRunner::default()
                .answer("file", 0, "Mach-O 64-bit executable arm64")
                .answer("lipo", 0, "Non-fat file: ffmpeg is architecture: x86_64")
                .answer(&banner_name, 0, "ffmpeg version 6.1 x86_64"),
        );

        let detection = classifier.classify(binary.path()).unwrap();
        assert_eq!(detection.architecture, Architecture::Arm64);
        assert_eq!(detection.strategy, Some(DetectionStrategy::FileType));
        assert_eq!(*runner.calls.lock(), vec!["file".to_string()]);
    }

    #[test]
    fn test_falls_through_to_lipo() {
        let binary = scratch_binary();
        let (classifier, _) = classifier(
            ScriptedRunner::default()
                .answer("file", 0, "data")
                .answer("lipo", 0, "Architectures in the fat file: ffmpeg are: x86_64"),
        );

        let detection = classifier.classify(binary.path()).unwrap();
        assert_eq!(detection.architecture, Architecture::X86_64);
        assert_eq!(detection.strategy, Some(DetectionStrategy::MultiArch));
    }

    #[test]
    fn test_failed_exit_is_skipped() {
        let binary = scratch_binary();
        let banner_name = binary.path().file_name().unwrap().to_string_lossy().into_owned();
        let (classifier, _) = classifier(
            ScriptedRunner::default()
                .answer("file", 0, "data")
                .answer("lipo", 1, "fatal error: arm64 mentioned in an error")
                .answer(&banner_name, 0, "ffmpeg version n6.0 built for arm64"),
        );

        let detection = classifier.classify(binary.path()).unwrap();
        assert_eq!(detection.architecture, Architecture::Arm64);
        assert_eq!(detection.strategy, Some(DetectionStrategy::VersionBanner));
    }

    #[test]
    fn test_exhausted_strategies_yield_unknown() {
        let binary = scratch_binary();
        let (classifier, runner) = classifier(ScriptedRunner::default().answer("file", 0, "data"));

        let detection = classifier.classify(binary.path()).unwrap();
        assert_eq!(detection.architecture, Architecture::Unknown);
        assert_eq!(detection.strategy, None);
        assert_eq!(runner.calls.lock().len(), 3);
    }

    #[test]
    fn test_missing_binary_is_not_found() {
        let (classifier, runner) = classifier(ScriptedRunner::default());
        let err = classifier
            .classify(Path::new("/nonexistent/Contents/MacOS/ffmpeg"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(runner.calls.lock().is_empty());
    }
}
