//! Backup artifacts and the copy primitives behind them.
//!
//! # Layout
//!
//! ```text
//! <parent>/
//! ├── EmbyServer.app/…/MacOS/
//! │   ├── ffmpeg                     live binary
//! │   ├── ffmpeg.backup              last-known-good copy
//! │   ├── ffmpeg.pretest             binary as it was before test mode
//! │   ├── ffmpeg_backup_original/
//! │   │   └── ffmpeg                 pristine original
//! │   └── ffmpeg_test_mode           marker (see test_mode)
//! ├── emby_backup_20240101_120000/   whole-tree snapshot
//! └── emby_initial_backup_…/         initial-state snapshot
//! ```
//!
//! Binary-level copies go through a temporary sibling and a rename, so the
//! destination is either the old or the new file, never a torn one. Tree
//! copies land under `<dest>.partial` and are renamed once complete.

use archfix_common::consts::{
    BINARY_BACKUP_SUFFIX, BINARY_TEMP_SUFFIX, INITIAL_SNAPSHOT_PREFIX, ORIGINAL_BACKUP_DIR,
    PARTIAL_COPY_SUFFIX, PRE_TEST_MODE_SUFFIX, SNAPSHOT_PREFIX, SNAPSHOT_TIMESTAMP_FORMAT,
};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Artifact, FixError};

/// Result of an idempotent backup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// A new backup was written.
    Created,
    /// A backup was already present and left untouched.
    AlreadyExists,
}

/// Which copy a restore read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    /// `<binary>.backup`.
    Backup,
    /// `ffmpeg_backup_original/<binary>`.
    Original,
    /// `<binary>.pretest`, saved when test mode was forced.
    PreTestMode,
}

/// Kind of whole-installation snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Ad-hoc snapshot (`emby_backup_<ts>`).
    Snapshot,
    /// Initial state before any change (`emby_initial_backup_<ts>`).
    Initial,
}

impl SnapshotKind {
    /// Directory name prefix.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Snapshot => SNAPSHOT_PREFIX,
            Self::Initial => INITIAL_SNAPSHOT_PREFIX,
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn sibling_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// `<binary>.backup`.
pub fn backup_path(binary: &Path) -> PathBuf {
    with_suffix(binary, BINARY_BACKUP_SUFFIX)
}

/// `<binary>.tmp`, the scratch file renamed over the binary.
pub fn temp_path(binary: &Path) -> PathBuf {
    with_suffix(binary, BINARY_TEMP_SUFFIX)
}

/// `<binary>.pretest`.
pub fn pre_test_mode_path(binary: &Path) -> PathBuf {
    with_suffix(binary, PRE_TEST_MODE_SUFFIX)
}

/// `<dest>.partial`, where a tree copy is written before it is renamed to `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    with_suffix(dest, PARTIAL_COPY_SUFFIX)
}

/// `ffmpeg_backup_original` next to the binary.
pub fn original_backup_dir(binary: &Path) -> PathBuf {
    sibling_dir(binary).join(ORIGINAL_BACKUP_DIR)
}

/// The pristine copy inside [`original_backup_dir`].
pub fn original_backup_path(binary: &Path) -> PathBuf {
    original_backup_dir(binary).join(binary.file_name().unwrap_or_default())
}

fn exists(path: &Path) -> Result<bool, FixError> {
    path.try_exists()
        .map_err(|e| FixError::fs("existence check", path, e))
}

/// `<installation>.restoring`, where the live tree waits during a snapshot restore.
pub fn displaced_path(installation: &Path) -> PathBuf {
    with_suffix(installation, ".restoring")
}

/// Either backup artifact is present.
pub fn has_backup(binary: &Path) -> Result<bool, FixError> {
    Ok(exists(&backup_path(binary))? || exists(&original_backup_path(binary))?)
}

/// Remove `path`, treating "already gone" as success.
pub fn remove_if_present(path: &Path) -> Result<bool, FixError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FixError::fs("remove", path, e)),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_tree_if_present(path: &Path) -> Result<bool, FixError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FixError::fs("remove", path, e)),
    }
}

/// Move a fully written scratch file over `dest`.
pub fn commit_temp(temp: &Path, dest: &Path) -> Result<(), FixError> {
    fs::rename(temp, dest).map_err(|e| {
        let _ = fs::remove_file(temp);
        FixError::fs("rename", dest, e)
    })
}

/// Copy `src` over `dest` through `<dest>.tmp` and a rename.
///
/// Permissions are carried over. On failure `dest` is untouched and the
/// scratch file is removed.
pub fn atomic_copy(src: &Path, dest: &Path) -> Result<(), FixError> {
    let temp = temp_path(dest);
    remove_if_present(&temp)?;
    fs::copy(src, &temp).map_err(|e| {
        let _ = fs::remove_file(&temp);
        FixError::fs("copy", src, e)
    })?;
    commit_temp(&temp, dest)?;
    debug!(from = %src.display(), to = %dest.display(), "Copied");
    Ok(())
}

/// Create `<binary>.backup` unless it exists, and seed the original copy.
///
/// An existing backup is never overwritten. The original-binary copy is
/// seeded from `<binary>.backup`, so both hold the same pre-change bytes.
///
/// # Errors
///
/// `NotFound(Binary)` if `binary` is missing; `Filesystem` if a copy fails.
/// A failure leaves the live binary untouched.
pub fn ensure_binary_backup(binary: &Path) -> Result<BackupStatus, FixError> {
    if !exists(binary)? {
        return Err(FixError::not_found(Artifact::Binary, binary));
    }

    let backup = backup_path(binary);
    let status = if exists(&backup)? {
        debug!(backup = %backup.display(), "Backup already present");
        BackupStatus::AlreadyExists
    } else {
        atomic_copy(binary, &backup)?;
        info!(backup = %backup.display(), "Backed up original binary");
        BackupStatus::Created
    };

    let original = original_backup_path(binary);
    if !exists(&original)? {
        let dir = original_backup_dir(binary);
        fs::create_dir_all(&dir).map_err(|e| FixError::fs("create directory", &dir, e))?;
        atomic_copy(&backup, &original)?;
        info!(original = %original.display(), "Stored pristine binary copy");
    }

    Ok(status)
}

/// Copy the backup over the live binary.
///
/// Reads `<binary>.backup`, falling back to the original-binary copy.
///
/// # Errors
///
/// `NotFound(Backup)` if neither exists.
pub fn restore_binary(binary: &Path) -> Result<RestoreSource, FixError> {
    let backup = backup_path(binary);
    let (source, path) = if exists(&backup)? {
        (RestoreSource::Backup, backup)
    } else {
        let original = original_backup_path(binary);
        if !exists(&original)? {
            return Err(FixError::not_found(Artifact::Backup, &backup));
        }
        warn!("{} missing, restoring from original copy", backup.display());
        (RestoreSource::Original, original)
    };

    atomic_copy(&path, binary)?;
    info!(from = %path.display(), to = %binary.display(), "Restored binary");
    Ok(source)
}

/// Save the live binary as `<binary>.pretest` unless a copy exists.
///
/// A second forced test mode keeps the first copy, so the bytes from
/// before any test mode survive until a restore.
pub fn save_pre_test_mode(binary: &Path) -> Result<BackupStatus, FixError> {
    let saved = pre_test_mode_path(binary);
    if exists(&saved)? {
        return Ok(BackupStatus::AlreadyExists);
    }
    atomic_copy(binary, &saved)?;
    debug!(saved = %saved.display(), "Saved binary ahead of test mode");
    Ok(BackupStatus::Created)
}

/// Copy `<binary>.pretest` back over the live binary.
///
/// Returns `Ok(false)` without touching anything if no copy exists. The
/// copy itself is left in place; see [`discard_pre_test_mode`].
pub fn restore_pre_test_mode(binary: &Path) -> Result<bool, FixError> {
    let saved = pre_test_mode_path(binary);
    if !exists(&saved)? {
        return Ok(false);
    }
    atomic_copy(&saved, binary)?;
    info!(from = %saved.display(), to = %binary.display(), "Restored binary from before test mode");
    Ok(true)
}

/// Delete `<binary>.pretest`; `Ok(true)` if one was removed.
pub fn discard_pre_test_mode(binary: &Path) -> Result<bool, FixError> {
    remove_if_present(&pre_test_mode_path(binary))
}

/// Byte-for-byte comparison of two files.
pub fn same_contents(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }

    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    let mut ba = [0u8; 8192];
    let mut bb = [0u8; 8192];
    loop {
        let na = ra.read(&mut ba)?;
        if na == 0 {
            return Ok(true);
        }
        rb.read_exact(&mut bb[..na])?;
        if ba[..na] != bb[..na] {
            return Ok(false);
        }
    }
}

/// Snapshot directory for `installation` taken at `at`.
pub fn snapshot_dir(installation: &Path, kind: SnapshotKind, at: NaiveDateTime) -> PathBuf {
    sibling_dir(installation).join(format!(
        "{}{}",
        kind.prefix(),
        at.format(SNAPSHOT_TIMESTAMP_FORMAT)
    ))
}

/// Snapshots of `kind` next to `installation`, oldest first.
///
/// Only names that parse completely count, so an unfinished
/// `<snapshot>.partial` copy is never listed.
pub fn list_snapshots(
    installation: &Path,
    kind: SnapshotKind,
) -> Result<Vec<(NaiveDateTime, PathBuf)>, FixError> {
    let parent = sibling_dir(installation);
    let entries = fs::read_dir(parent).map_err(|e| FixError::fs("list", parent, e))?;

    let mut found: Vec<_> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|entry| {
            let name = entry.file_name();
            let stamp = name.to_str()?.strip_prefix(kind.prefix())?;
            let at = NaiveDateTime::parse_from_str(stamp, SNAPSHOT_TIMESTAMP_FORMAT).ok()?;
            Some((at, entry.path()))
        })
        .collect();
    found.sort();
    Ok(found)
}

/// Most recent snapshot of `kind`, if any.
pub fn latest_snapshot(installation: &Path, kind: SnapshotKind) -> Result<Option<PathBuf>, FixError> {
    Ok(list_snapshots(installation, kind)?
        .pop()
        .map(|(_, path)| path))
}
