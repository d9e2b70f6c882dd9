//! Prelude module for common re-exports.
//!
//! ```rust
//! use archfix_common::prelude::*;
//! ```

// ─── Architecture ───────────────────────────────────────────────────
pub use crate::arch::{Architecture, ParseArchitectureError};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, FixerConfig, LogLevel, SharedConfig, ToolPaths};

// ─── Naming Conventions ─────────────────────────────────────────────
pub use crate::consts::{
    BINARY_BACKUP_SUFFIX, DEFAULT_BINARY_NAME, INITIAL_SNAPSHOT_PREFIX, ORIGINAL_BACKUP_DIR,
    SNAPSHOT_PREFIX, STOP_GRACE_PERIOD, TEST_MODE_MARKER,
};
