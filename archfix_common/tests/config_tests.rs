//! Config loading tests.
//!
//! Tests for `FixerConfig::load_or_default()` against files on disk:
//! partial files filled from defaults, validation errors surfacing
//! through the loader, and architecture values inside TOML.

use archfix_common::prelude::*;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Write `body` as archfix.toml in a fresh directory.
fn write_config(body: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("archfix.toml");
    fs::write(&path, body).unwrap();
    (dir, path)
}

#[test]
fn test_partial_file_keeps_defaults() {
    let (_dir, path) = write_config(
        r#"
[tools]
file = "/usr/bin/file"
"#,
    );

    let config = FixerConfig::load_or_default(&path).unwrap();
    assert_eq!(config.tools.file, PathBuf::from("/usr/bin/file"));
    assert_eq!(config.tools.lipo, PathBuf::from("lipo"));
    assert_eq!(config.tools.copy, PathBuf::from("cp"));
    assert_eq!(config.binary_name, DEFAULT_BINARY_NAME);
    assert_eq!(config.applications_dir, PathBuf::from("/Applications"));
    assert_eq!(config.shared.log_level, LogLevel::Info);
}

#[test]
fn test_empty_file_is_all_defaults() {
    let (_dir, path) = write_config("");
    let config = FixerConfig::load_or_default(&path).unwrap();
    assert_eq!(config.shared.service_name, "archfix");
    assert!(config.replacement_binary.is_none());
}

#[test]
fn test_validation_error_is_not_masked_by_defaults() {
    let (_dir, path) = write_config(
        r#"
binary_name = ""
"#,
    );
    let err = FixerConfig::load_or_default(&path).unwrap_err();
    assert!(
        matches!(err, ConfigError::ValidationError(_)),
        "empty binary_name must fail validation, got {err:?}"
    );
}

#[test]
fn test_bad_log_level_is_parse_error() {
    let (_dir, path) = write_config(
        r#"
[shared]
log_level = "chatty"
"#,
    );
    assert!(matches!(
        FixerConfig::load_or_default(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_architecture_in_toml() {
    #[derive(Debug, Deserialize)]
    struct Wrapper {
        target: Architecture,
    }

    let (_dir, path) = write_config(r#"target = "arm64""#);
    let parsed = Wrapper::load(&path).unwrap();
    assert_eq!(parsed.target, Architecture::Arm64);

    let (_dir, path) = write_config(r#"target = "x86_64""#);
    assert_eq!(Wrapper::load(&path).unwrap().target, Architecture::X86_64);

    let (_dir, path) = write_config(r#"target = "sparc""#);
    assert!(matches!(Wrapper::load(&path), Err(ConfigError::ParseError(_))));
}

#[test]
fn test_naming_constants_compose() {
    assert_eq!(format!("ffmpeg{BINARY_BACKUP_SUFFIX}"), "ffmpeg.backup");
    assert!(SNAPSHOT_PREFIX.ends_with('_'));
    assert!(INITIAL_SNAPSHOT_PREFIX.starts_with("emby_"));
    assert_ne!(TEST_MODE_MARKER, ORIGINAL_BACKUP_DIR);
}
