//! Process-wide record of the transfer currently writing to disk.
//!
//! A transport sets the slot with [`begin`] just before it starts writing a
//! destination file and clears it with [`end`] once the file is complete.
//! The termination handler calls [`finalize`], which stamps the partial file
//! with the server's modification time so the next run can resume it with a
//! conditional request.

use std::path::PathBuf;
use std::time::SystemTime;

use filetime::FileTime;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// The file being written and the timestamp it should carry if interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialTransfer {
    pub path: PathBuf,
    pub timestamp: Option<SystemTime>,
}

static SLOT: Mutex<Option<PartialTransfer>> = parking_lot::const_mutex(None);

/// Record the start of a write to `path`.
pub fn begin(path: impl Into<PathBuf>, timestamp: Option<SystemTime>) {
    *SLOT.lock() = Some(PartialTransfer {
        path: path.into(),
        timestamp,
    });
}

/// Clear the slot after a clean finish.
pub fn end() {
    *SLOT.lock() = None;
}

pub fn current() -> Option<PartialTransfer> {
    SLOT.lock().clone()
}

/// Stamp the interrupted file, if any, and clear the slot.
///
/// Returns the path that was stamped.
pub fn finalize() -> Option<PathBuf> {
    let transfer = SLOT.lock().take()?;
    let timestamp = transfer.timestamp?;
    let time = FileTime::from_system_time(timestamp);
    match filetime::set_file_times(&transfer.path, time, time) {
        Ok(()) => {
            debug!(path = %transfer.path.display(), "stamped partial file");
            Some(transfer.path)
        }
        Err(e) => {
            warn!(path = %transfer.path.display(), error = %e, "failed to stamp partial file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    // One test owns the process-wide slot.
    #[test]
    fn test_slot_lifecycle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial");
        std::fs::write(&path, b"half").unwrap();
        let stamp = UNIX_EPOCH + Duration::from_secs(1_000_000_000);

        begin(&path, Some(stamp));
        assert_eq!(current().unwrap().path, path);
        end();
        assert!(current().is_none());
        assert!(finalize().is_none());

        begin(&path, Some(stamp));
        assert_eq!(finalize(), Some(path.clone()));
        assert!(current().is_none());
        let mtime = FileTime::from_last_modification_time(&std::fs::metadata(&path).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_000_000_000);

        begin(&path, None);
        assert!(finalize().is_none());
        assert!(current().is_none());
    }
}
