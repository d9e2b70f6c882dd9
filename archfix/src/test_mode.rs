//! Test-mode marker.
//!
//! `ffmpeg_test_mode` next to the binary records that the binary was
//! deliberately thinned to an incompatible architecture. Body is TOML:
//!
//! ```toml
//! forced_architecture = "x86_64"
//! host_architecture = "arm64"
//! created_at = "2024-03-09T07:05:03+01:00"
//! ```

use archfix_common::arch::Architecture;
use archfix_common::consts::TEST_MODE_MARKER;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup;
use crate::error::FixError;

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestModeMarker {
    /// Architecture the binary was thinned to.
    pub forced_architecture: Architecture,
    /// Host architecture at the time.
    pub host_architecture: Architecture,
    /// RFC 3339 creation time.
    pub created_at: String,
}

impl TestModeMarker {
    /// Marker stamped with the current local time.
    pub fn now(forced: Architecture, host: Architecture) -> Self {
        Self {
            forced_architecture: forced,
            host_architecture: host,
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// What is on disk at the marker path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    /// No marker file.
    Absent,
    /// Parsed marker.
    Present(TestModeMarker),
    /// A file exists but does not parse.
    Unreadable(String),
}

/// Marker location for `binary`.
pub fn marker_path(binary: &Path) -> PathBuf {
    match binary.parent() {
        Some(parent) => parent.join(TEST_MODE_MARKER),
        None => PathBuf::from(TEST_MODE_MARKER),
    }
}

/// Marker file contents as stored, `None` if there is no marker.
pub fn read_marker_text(binary: &Path) -> Result<Option<String>, FixError> {
    let path = marker_path(binary);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FixError::fs("read", &path, e)),
    }
}

/// Put back contents taken by [`read_marker_text`]: rewrite, or remove if `None`.
pub fn restore_marker_text(binary: &Path, text: Option<&str>) -> Result<(), FixError> {
    match text {
        Some(text) => write_text(&marker_path(binary), text),
        None => backup::remove_if_present(&marker_path(binary)).map(|_| ()),
    }
}

/// Read the marker for `binary`.
pub fn read_marker(binary: &Path) -> Result<MarkerState, FixError> {
    let Some(text) = read_marker_text(binary)? else {
        return Ok(MarkerState::Absent);
    };

    match toml::from_str(&text) {
        Ok(marker) => Ok(MarkerState::Present(marker)),
        Err(e) => {
            warn!(marker = %marker_path(binary).display(), "Test mode marker does not parse: {e}");
            Ok(MarkerState::Unreadable(e.to_string()))
        }
    }
}

/// Write the marker for `binary` through a temp file and rename.
pub fn write_marker(binary: &Path, marker: &TestModeMarker) -> Result<(), FixError> {
    let path = marker_path(binary);
    let body = toml::to_string(marker)
        .map_err(|e| FixError::fs("serialize", &path, io::Error::other(e)))?;
    write_text(&path, &body)?;
    info!(marker = %path.display(), forced = %marker.forced_architecture, "Test mode marker written");
    Ok(())
}

fn write_text(path: &Path, body: &str) -> Result<(), FixError> {
    let temp = backup::temp_path(path);
    fs::write(&temp, body).map_err(|e| FixError::fs("write", &temp, e))?;
    backup::commit_temp(&temp, path)
}

/// Delete the marker; `Ok(true)` if one was removed.
pub fn clear_marker(binary: &Path) -> Result<bool, FixError> {
    let removed = backup::remove_if_present(&marker_path(binary))?;
    if removed {
        info!(binary = %binary.display(), "Test mode marker removed");
    }
    Ok(removed)
}
