//! Locating the transcoding binary inside an installation.

use archfix_common::consts::{CONVENTIONAL_BINARY_DIRS, ORIGINAL_BACKUP_DIR};
use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{Artifact, FixError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Executable,
    NotExecutable,
    Absent,
}

fn probe(path: &Path) -> Candidate {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            if meta.permissions().mode() & 0o111 != 0 {
                Candidate::Executable
            } else {
                Candidate::NotExecutable
            }
        }
        _ => Candidate::Absent,
    }
}

/// Find the executable `binary_name` inside `installation`.
///
/// Conventional bundle locations are tried first, in order. Otherwise the
/// bundle is walked breadth-first with directory entries sorted by name,
/// so the shallowest match wins and ties break alphabetically. Symlinked
/// directories and the original-binary backup directory are not entered.
/// Matches without an execute bit are logged and skipped.
///
/// # Errors
///
/// `NotFound(Installation)` if `installation` is not a directory,
/// `NotFound(Binary)` if no executable match exists.
pub fn locate_binary(installation: &Path, binary_name: &str) -> Result<PathBuf, FixError> {
    if !installation.is_dir() {
        error!(path = %installation.display(), "Installation path is not a directory");
        return Err(FixError::not_found(Artifact::Installation, installation));
    }
    info!(path = %installation.display(), "Searching for {binary_name}");

    for dir in CONVENTIONAL_BINARY_DIRS {
        let candidate = installation.join(dir).join(binary_name);
        debug!("Checking: {}", candidate.display());
        match probe(&candidate) {
            Candidate::Executable => {
                info!("Found executable {binary_name} at: {}", candidate.display());
                return Ok(candidate);
            }
            Candidate::NotExecutable => {
                warn!("Found {binary_name} at {} but it's not executable", candidate.display());
            }
            Candidate::Absent => {}
        }
    }

    info!("{binary_name} not found in standard locations, searching entire bundle...");
    if let Some(found) = walk(installation, binary_name) {
        info!("Found executable {binary_name} at: {}", found.display());
        return Ok(found);
    }

    error!(path = %installation.display(), "{binary_name} not found in installation");
    Err(FixError::not_found(
        Artifact::Binary,
        &installation.join(binary_name),
    ))
}

fn walk(root: &Path, binary_name: &str) -> Option<PathBuf> {
    let mut queue = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let mut entries: Vec<_> = match fs::read_dir(&dir) {
            Ok(entries) => entries.flatten().collect(),
            Err(e) => {
                debug!(dir = %dir.display(), "Skipping unreadable directory: {e}");
                continue;
            }
        };
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if name == binary_name {
                match probe(&path) {
                    Candidate::Executable => return Some(path),
                    Candidate::NotExecutable => warn!(
                        "Found {binary_name} at {} but it's not executable",
                        path.display()
                    ),
                    Candidate::Absent => {}
                }
            }

            if file_type.is_dir() && name != ORIGINAL_BACKUP_DIR {
                queue.push_back(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn put(path: &Path, mode: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_conventional_location_found_first() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("EmbyServer.app");
        put(&app.join("Contents/Resources/ffmpeg"), 0o755);
        put(&app.join("Contents/MacOS/ffmpeg"), 0o755);

        let found = locate_binary(&app, "ffmpeg").unwrap();
        assert_eq!(found, app.join("Contents/MacOS/ffmpeg"));
    }

    #[test]
    fn test_non_executable_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("EmbyServer.app");
        put(&app.join("Contents/MacOS/ffmpeg"), 0o644);
        put(&app.join("Contents/Resources/ffmpeg"), 0o755);

        let found = locate_binary(&app, "ffmpeg").unwrap();
        assert_eq!(found, app.join("Contents/Resources/ffmpeg"));
    }

    #[test]
    fn test_walk_prefers_shallowest_then_name() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("Emby.app");
        put(&app.join("lib/deep/nested/ffmpeg"), 0o755);
        put(&app.join("zeta/ffmpeg"), 0o755);
        put(&app.join("alpha/ffmpeg"), 0o755);

        let found = locate_binary(&app, "ffmpeg").unwrap();
        assert_eq!(found, app.join("alpha/ffmpeg"));
    }

    #[test]
    fn test_walk_skips_original_backup_and_symlinked_dirs() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("Emby.app");
        put(&app.join("bin").join(ORIGINAL_BACKUP_DIR).join("ffmpeg"), 0o755);

        let outside = tmp.path().join("outside");
        put(&outside.join("ffmpeg"), 0o755);
        fs::create_dir_all(&app).unwrap();
        symlink(&outside, app.join("linked")).unwrap();

        let err = locate_binary(&app, "ffmpeg").unwrap_err();
        assert!(
            matches!(err, FixError::NotFound { what: Artifact::Binary, .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn test_missing_installation_distinct_from_missing_binary() {
        let tmp = TempDir::new().unwrap();
        let err = locate_binary(&tmp.path().join("Nope.app"), "ffmpeg").unwrap_err();
        assert!(matches!(
            err,
            FixError::NotFound {
                what: Artifact::Installation,
                ..
            }
        ));
    }
}
