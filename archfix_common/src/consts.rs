//! Naming conventions and fixed limits for the archfix workspace.
//!
//! The on-disk names below are an interoperability contract: external
//! tooling inspects installations by these exact names.

use std::time::Duration;

/// File name of the transcoding binary inside an installation.
pub const DEFAULT_BINARY_NAME: &str = "ffmpeg";

/// Suffix appended to the binary file name for the last-known-good copy.
pub const BINARY_BACKUP_SUFFIX: &str = ".backup";

/// Suffix for the scratch file written before a rename replaces the binary.
pub const BINARY_TEMP_SUFFIX: &str = ".tmp";

/// Suffix for the copy of the binary taken just before test mode is forced.
pub const PRE_TEST_MODE_SUFFIX: &str = ".pretest";

/// Suffix of a tree copy still in progress; renamed away once complete.
pub const PARTIAL_COPY_SUFFIX: &str = ".partial";

/// Directory, next to the binary, holding the pristine original binary.
pub const ORIGINAL_BACKUP_DIR: &str = "ffmpeg_backup_original";

/// Marker file, next to the binary, present while test mode is active.
pub const TEST_MODE_MARKER: &str = "ffmpeg_test_mode";

/// Prefix of whole-installation snapshot directories.
pub const SNAPSHOT_PREFIX: &str = "emby_backup_";

/// Prefix of initial-state snapshot directories.
pub const INITIAL_SNAPSHOT_PREFIX: &str = "emby_initial_backup_";

/// `chrono` format of the snapshot directory suffix.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Conventional locations of the binary, relative to the bundle root.
/// Searched in order before falling back to a full walk.
pub const CONVENTIONAL_BINARY_DIRS: &[&str] = &[
    "Contents/MacOS",
    "Contents/Resources",
    "Contents/Frameworks",
    "Contents/MacOS/Emby Server",
    "Contents/Resources/Emby Server",
    "Contents/Frameworks/Emby Server",
];

/// Bundle names probed when looking for the default installation.
pub const DEFAULT_INSTALLATION_NAMES: &[&str] = &["EmbyServer.app", "Emby Server.app"];

/// Default directory scanned for installations.
pub const DEFAULT_APPLICATIONS_DIR: &str = "/Applications";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/archfix/archfix.toml";

/// Grace period between SIGTERM and SIGKILL when stopping an operation.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Interval at which a blocked start polls its child for exit.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(25);
