//! Configuration loading traits and types.
//!
//! This module provides the TOML configuration of the `archfix` service:
//! logging, which external tools to invoke, and where installations live.
//!
//! # Usage
//!
//! ```rust,no_run
//! use archfix_common::config::{ConfigLoader, ConfigError, FixerConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = FixerConfig::load(Path::new("archfix.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consts::{DEFAULT_APPLICATIONS_DIR, DEFAULT_BINARY_NAME};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common service fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "archfix"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Service instance identifier.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    "archfix".to_string()
}

/// External programs the service shells out to.
///
/// Values are program names resolved through `PATH`, or absolute paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// File-type classification utility.
    pub file: PathBuf,
    /// Multi-architecture inspection and thinning utility.
    pub lipo: PathBuf,
    /// Hardware-profile query utility.
    pub system_profiler: PathBuf,
    /// Recursive copy utility used for whole-installation snapshots.
    pub copy: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            file: PathBuf::from("file"),
            lipo: PathBuf::from("lipo"),
            system_profiler: PathBuf::from("system_profiler"),
            copy: PathBuf::from("cp"),
        }
    }
}

/// Top-level configuration of the `archfix` service.
///
/// # TOML Example
///
/// ```toml
/// binary_name = "ffmpeg"
/// applications_dir = "/Applications"
/// replacement_binary = "/opt/ffmpeg/x86_64/ffmpeg"
///
/// [shared]
/// log_level = "info"
/// service_name = "archfix"
///
/// [tools]
/// lipo = "/usr/bin/lipo"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixerConfig {
    /// Logging and identity.
    #[serde(default)]
    pub shared: SharedConfig,

    /// File name of the transcoding binary inside an installation.
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Directory scanned when discovering installations.
    #[serde(default = "default_applications_dir")]
    pub applications_dir: PathBuf,

    /// Host-compatible binary copied in by a fix. When absent, a fix
    /// thins the backed-up binary down to the host architecture.
    #[serde(default)]
    pub replacement_binary: Option<PathBuf>,

    /// External tool locations.
    #[serde(default)]
    pub tools: ToolPaths,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig::default(),
            binary_name: default_binary_name(),
            applications_dir: default_applications_dir(),
            replacement_binary: None,
            tools: ToolPaths::default(),
        }
    }
}

impl FixerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `shared` is invalid
    /// - `binary_name` is empty or contains a path separator
    /// - any tool path is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.binary_name.is_empty() || self.binary_name.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "binary_name must be a plain file name, got '{}'",
                self.binary_name
            )));
        }

        let tools = [
            ("file", &self.tools.file),
            ("lipo", &self.tools.lipo),
            ("system_profiler", &self.tools.system_profiler),
            ("copy", &self.tools.copy),
        ];
        for (name, path) in tools {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "tools.{name} cannot be empty"
                )));
            }
        }
        Ok(())
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    ///
    /// Parse and validation errors are never masked.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::FileNotFound) => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_binary_name() -> String {
    DEFAULT_BINARY_NAME.to_string()
}

fn default_applications_dir() -> PathBuf {
    PathBuf::from(DEFAULT_APPLICATIONS_DIR)
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can use ConfigLoader.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
