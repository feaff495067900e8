//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

/// How long a new session may take to report a ready engine.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a single translation may stay in flight.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on the discard notice and the port close during teardown.
pub const TEARDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing child gets to take queued input before it is killed.
pub const STDIN_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Reason used when an engine reports a non-ready status without one.
pub const DEFAULT_NOT_READY_MESSAGE: &str = "the engine did not report a ready status";

/// Environment variables a translator process reads its language pair from.
pub const ENV_SOURCE_LANGUAGE: &str = "COURIER_SOURCE_LANGUAGE";
pub const ENV_TARGET_LANGUAGE: &str = "COURIER_TARGET_LANGUAGE";

/// Default settings database: `~/.courier/courier.db`.
/// Falls back to the working directory when there is no home directory.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".courier"))
        .unwrap_or_default()
        .join("courier.db")
}
