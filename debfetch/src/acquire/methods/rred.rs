//! `rred:` pivots: apply pending ed patches to an index.
//!
//! The URI names the index to patch. A single downloaded patch waits next
//! to it as `<index>.ed`; a merged set waits as `<index>.ed.<name>.gz` and
//! is applied in name order. The result goes to the requested file name.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::acquire::{EventSink, MethodConfig};
use crate::item::with_suffix;
use crate::message::Message;
use crate::pdiff::apply_ed_patches;

use super::{local_capabilities, FetchRequest, Method};

#[derive(Debug, Default, Clone, Copy)]
pub struct RredMethod;

/// Patches waiting for `base`, in application order.
fn pending_patches(base: &Path) -> Result<Vec<PathBuf>, String> {
    let single = with_suffix(base, ".ed");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let pattern = format!(
        "{}.ed.*.gz",
        glob::Pattern::escape(&base.display().to_string())
    );
    let mut patches: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| e.to_string())?
        .filter_map(Result::ok)
        .collect();
    patches.sort();
    Ok(patches)
}

impl Method for RredMethod {
    fn config(&self) -> MethodConfig {
        local_capabilities("rred")
    }

    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message {
        let patches = match pending_patches(&request.path) {
            Ok(patches) if !patches.is_empty() => patches,
            Ok(_) => return request.failure(format!("No patches found for {}", request.path.display())),
            Err(e) => return request.failure(e),
        };
        debug!(base = %request.path.display(), count = patches.len(), "applying patches");

        let size = request.path.metadata().map(|m| m.len()).unwrap_or(0);
        sink.send(request.started(size, 0));
        if let Err(e) = apply_ed_patches(&request.path, &patches, &request.filename) {
            crate::item::remove_quietly(&request.filename);
            return request.failure(e.to_string());
        }
        request
            .done(&request.filename)
            .unwrap_or_else(|e| request.failure(e))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_single_patch() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("Packages");
        fs::write(&base, "a\nb\nc\n").unwrap();
        fs::write(with_suffix(&base, ".ed"), gz(b"2c\nB\n.\n")).unwrap();

        let out = temp.path().join("Packages.out");
        let (sink, _rx) = sink();
        let msg = RredMethod.fetch(&request(&format!("rred:{}", base.display()), &out), &sink);

        assert_eq!(msg.code, crate::message::URI_DONE);
        assert_eq!(fs::read_to_string(&out).unwrap(), "a\nB\nc\n");
    }

    #[test]
    fn test_merged_patches_in_name_order() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("Packages");
        fs::write(&base, "a\n").unwrap();
        fs::write(with_suffix(&base, ".ed.2024-01-02.gz"), gz(b"2a\nc\n.\n")).unwrap();
        fs::write(with_suffix(&base, ".ed.2024-01-01.gz"), gz(b"1a\nb\n.\n")).unwrap();

        let patches = pending_patches(&base).unwrap();
        assert_eq!(patches.len(), 2);
        assert!(patches[0].display().to_string().ends_with("2024-01-01.gz"));

        let out = temp.path().join("out");
        let (sink, _rx) = sink();
        let msg = RredMethod.fetch(&request(&format!("rred:{}", base.display()), &out), &sink);
        assert_eq!(msg.code, crate::message::URI_DONE);
        assert_eq!(fs::read_to_string(&out).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn test_no_patches() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("Packages");
        fs::write(&base, "a\n").unwrap();
        let (sink, _rx) = sink();
        let msg = RredMethod.fetch(
            &request(&format!("rred:{}", base.display()), &temp.path().join("o")),
            &sink,
        );
        assert_eq!(msg.code, crate::message::URI_FAILURE);
    }
}
