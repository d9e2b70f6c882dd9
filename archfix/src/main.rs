//! # archfix Binary
//!
//! Command-line front end for the installation state machine. Each
//! subcommand runs one operation and prints its result as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Is the bundled transcoder compatible with this machine?
//! archfix check --installation /Applications/EmbyServer.app
//!
//! # Replace it with a host-compatible build, keeping a backup
//! archfix fix
//!
//! # Simulate an incompatible binary, then undo it
//! archfix force-test-mode --arch x86_64
//! archfix restore
//!
//! # Verbose JSON logs with a custom config
//! archfix --config ./archfix.toml -v --json inspect
//! ```

use archfix::backup::SnapshotKind;
use archfix::discovery;
use archfix::{ControlPlane, FixError, RequestOrigin};
use archfix_common::arch::Architecture;
use archfix_common::config::{FixerConfig, LogLevel};
use archfix_common::consts::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// archfix - transcoder architecture repair for media-server installations
#[derive(Parser, Debug)]
#[command(name = "archfix")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Detect and repair CPU-architecture mismatches of a bundled transcoder")]
#[command(long_about = None)]
struct Args {
    /// Path to configuration file (archfix.toml). Defaults apply if missing.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Installation selector shared by most subcommands.
#[derive(clap::Args, Debug)]
struct Target {
    /// Installation bundle; defaults to the first Emby bundle in `applications_dir`
    #[arg(short, long, value_name = "PATH")]
    installation: Option<PathBuf>,
}

impl Target {
    fn resolve(&self, config: &FixerConfig) -> Result<PathBuf, FixError> {
        match &self.installation {
            Some(path) => Ok(path.clone()),
            None => discovery::default_installation(&config.applications_dir),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the path of the transcoding binary
    Locate(Target),
    /// Classify the architecture of a binary
    Classify {
        /// Binary to classify
        binary: PathBuf,
    },
    /// Print the host architecture
    Host {
        /// Use the detection strategy for remote requests
        #[arg(long)]
        remote: bool,
    },
    /// Compare the binary's architecture with the host
    Check {
        #[command(flatten)]
        target: Target,
        /// Treat the request as coming from a remote address
        #[arg(long)]
        remote: bool,
    },
    /// Report the installation's derived state
    Inspect {
        #[command(flatten)]
        target: Target,
        /// Treat the request as coming from a remote address
        #[arg(long)]
        remote: bool,
    },
    /// Back up the binary unless a backup exists
    Backup(Target),
    /// Replace the binary with a host-compatible one
    Fix {
        #[command(flatten)]
        target: Target,
        /// Treat the request as coming from a remote address
        #[arg(long)]
        remote: bool,
    },
    /// Restore the binary from its backup and leave test mode
    Restore(Target),
    /// Thin the binary to an incompatible architecture for testing
    ForceTestMode {
        #[command(flatten)]
        target: Target,
        /// Architecture to force (x86_64 or arm64)
        #[arg(short, long)]
        arch: Architecture,
    },
    /// Report test-mode status
    TestMode(Target),
    /// Snapshot the whole installation tree
    Snapshot {
        #[command(flatten)]
        target: Target,
        /// Take an initial-state snapshot
        #[arg(long)]
        initial: bool,
    },
    /// Replace the installation tree with a snapshot
    RestoreSnapshot {
        #[command(flatten)]
        target: Target,
        /// Snapshot directory
        snapshot: PathBuf,
    },
    /// Restore the latest initial-state snapshot
    RestoreInitial(Target),
    /// List installations in the applications directory
    Discover,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("archfix failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = FixerConfig::load_or_default(&args.config);
    let level = match &config {
        _ if args.verbose => LogLevel::Debug,
        Ok(config) => config.shared.log_level,
        Err(_) => LogLevel::Info,
    };
    setup_tracing(&args, level);
    let config = config?;

    info!("archfix v{} starting...", env!("CARGO_PKG_VERSION"));

    let plane = ControlPlane::system(&config);

    // Ctrl-C stops the in-flight operation; the blocked call then returns.
    let supervisor = plane.supervisor();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        if let Err(e) = supervisor.stop() {
            error!("Failed to stop operation: {e}");
        }
    })?;

    let outcome = execute(&plane, &config, args.command);

    if let Err(e) = plane.shutdown() {
        warn!("Supervisor shutdown reported an error: {e}");
    }

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!("{e}");
            let body = json!({ "error": e.kind(), "message": e.to_string() });
            println!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(1);
        }
    }
}

fn execute(plane: &ControlPlane, config: &FixerConfig, command: Command) -> Result<Value, FixError> {
    let machine = plane.installation();

    let value = match command {
        Command::Locate(target) => {
            let installation = target.resolve(config)?;
            let binary = machine.locate(&installation)?;
            json!({ "installation": installation, "binary": binary })
        }
        Command::Classify { binary } => {
            let architecture = machine.classify(&binary)?;
            json!({ "binary": binary, "architecture": architecture })
        }
        Command::Host { remote } => {
            let origin = RequestOrigin::from_remote_flag(remote);
            json!({ "origin": origin, "architecture": machine.host_architecture(origin) })
        }
        Command::Check { target, remote } => {
            let report = machine
                .check_compatibility(&target.resolve(config)?, RequestOrigin::from_remote_flag(remote))?;
            json!({ "message": report.to_string(), "report": report })
        }
        Command::Inspect { target, remote } => json!(
            machine.inspect(&target.resolve(config)?, RequestOrigin::from_remote_flag(remote))?
        ),
        Command::Backup(target) => {
            json!({ "backup": machine.ensure_backup(&target.resolve(config)?)? })
        }
        Command::Fix { target, remote } => json!(
            machine.fix(&target.resolve(config)?, RequestOrigin::from_remote_flag(remote))?
        ),
        Command::Restore(target) => json!(machine.restore(&target.resolve(config)?)?),
        Command::ForceTestMode { target, arch } => {
            json!(machine.force_test_mode(&target.resolve(config)?, arch)?)
        }
        Command::TestMode(target) => json!(machine.check_test_mode(&target.resolve(config)?)?),
        Command::Snapshot { target, initial } => {
            let kind = if initial {
                SnapshotKind::Initial
            } else {
                SnapshotKind::Snapshot
            };
            let snapshot = machine.snapshot(&target.resolve(config)?, kind)?;
            json!({ "kind": kind, "snapshot": snapshot })
        }
        Command::RestoreSnapshot { target, snapshot } => {
            let installation = target.resolve(config)?;
            machine.restore_snapshot(&installation, &snapshot)?;
            json!({ "installation": installation, "snapshot": snapshot })
        }
        Command::RestoreInitial(target) => {
            let installation = target.resolve(config)?;
            let snapshot = machine.restore_initial_state(&installation)?;
            json!({ "installation": installation, "snapshot": snapshot })
        }
        Command::Discover => json!({
            "installations": discovery::discover_installations(&config.applications_dir)?
        }),
    };
    Ok(value)
}

/// Setup tracing subscriber based on CLI arguments and config.
///
/// Logs go to stderr so stdout carries only the JSON result.
fn setup_tracing(args: &Args, level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
