//! Mirror failure reporting.
//!
//! When an item fetched through a mirror fails, an external script is told
//! which mirror was used, what was requested and why it failed. Reporting
//! never affects the item.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

/// Script run when no other is configured.
pub const DEFAULT_REPORT_SCRIPT: &str = "/usr/lib/apt/apt-report-mirror-failure";

/// One failure to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorFailure {
    pub used_mirror: String,
    pub describe_uri: String,
    pub fail_code: String,
}

/// Run the report script. Returns whether a report was delivered.
pub fn report_failure(script: Option<&Path>, failure: &MirrorFailure) -> bool {
    if failure.used_mirror.is_empty() {
        return false;
    }
    let script: PathBuf = script
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_SCRIPT));
    if !script.exists() {
        debug!(script = %script.display(), "no mirror report script");
        return false;
    }

    let status = Command::new(&script)
        .arg(&failure.used_mirror)
        .arg(&failure.describe_uri)
        .arg(&failure.fail_code)
        .stdin(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(script = %script.display(), status = %status, "Couldn't report problem to mirror script");
            false
        }
        Err(e) => {
            warn!(script = %script.display(), error = %e, "Couldn't report problem to mirror script");
            false
        }
    }
}
