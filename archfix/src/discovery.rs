//! Finding installations in an applications directory.

use archfix_common::consts::DEFAULT_INSTALLATION_NAMES;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Artifact, FixError};

/// `Emby*.app` or `*Emby*Server*.app`, ignoring case.
fn is_installation_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    let Some(stem) = lower.strip_suffix(".app") else {
        return false;
    };
    stem.starts_with("emby") || stem.find("emby").is_some_and(|i| stem[i..].contains("server"))
}

/// Installation bundles directly inside `apps_dir`, sorted by name.
///
/// # Errors
///
/// `Filesystem` if `apps_dir` cannot be listed.
pub fn discover_installations(apps_dir: &Path) -> Result<Vec<PathBuf>, FixError> {
    let entries = fs::read_dir(apps_dir).map_err(|e| FixError::fs("list", apps_dir, e))?;

    let mut found: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|entry| entry.file_name().to_str().is_some_and(is_installation_name))
        .map(|entry| entry.path())
        .collect();
    found.sort();

    debug!(dir = %apps_dir.display(), count = found.len(), "Discovered installations");
    Ok(found)
}

/// The installation a request without a path refers to.
///
/// The well-known bundle names are tried first, then the first
/// discovered bundle.
pub fn default_installation(apps_dir: &Path) -> Result<PathBuf, FixError> {
    for name in DEFAULT_INSTALLATION_NAMES {
        let candidate = apps_dir.join(name);
        if candidate.is_dir() {
            info!(path = %candidate.display(), "Using default installation");
            return Ok(candidate);
        }
    }

    discover_installations(apps_dir)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            FixError::not_found(
                Artifact::Installation,
                &apps_dir.join(DEFAULT_INSTALLATION_NAMES[0]),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_name_pattern() {
        assert!(is_installation_name("EmbyServer.app"));
        assert!(is_installation_name("Emby Server.app"));
        assert!(is_installation_name("Emby.app"));
        assert!(is_installation_name("Media emby server.app"));
        assert!(!is_installation_name("Media Emby.app"));
        assert!(!is_installation_name("Jellyfin.app"));
        assert!(!is_installation_name("Emby"));
        assert!(!is_installation_name("EmbyServer.dmg"));
    }

    #[test]
    fn test_discovery_is_sorted_and_skips_files() {
        let tmp = TempDir::new().unwrap();
        for dir in ["Emby Server.app", "Emby.app", "Safari.app"] {
            fs::create_dir(tmp.path().join(dir)).unwrap();
        }
        fs::write(tmp.path().join("EmbyServer.app"), b"not a bundle").unwrap();

        let found = discover_installations(tmp.path()).unwrap();
        assert_eq!(
            found,
            vec![tmp.path().join("Emby Server.app"), tmp.path().join("Emby.app")]
        );
    }

    #[test]
    fn test_default_prefers_well_known_name() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("Emby Beta.app")).unwrap();
        fs::create_dir(tmp.path().join("EmbyServer.app")).unwrap();
        assert_eq!(
            default_installation(tmp.path()).unwrap(),
            tmp.path().join("EmbyServer.app")
        );
    }

    #[test]
    fn test_default_falls_back_then_fails() {
        let tmp = TempDir::new().unwrap();
        let err = default_installation(tmp.path()).unwrap_err();
        assert!(matches!(err, FixError::NotFound { what: Artifact::Installation, .. }));

        fs::create_dir(tmp.path().join("Emby Beta.app")).unwrap();
        assert_eq!(
            default_installation(tmp.path()).unwrap(),
            tmp.path().join("Emby Beta.app")
        );
    }
}
