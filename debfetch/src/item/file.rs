//! Single file downloads to an explicit destination.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use tracing::debug;

use crate::acquire::MethodConfig;
use crate::hashes::HashString;
use crate::message::Message;
use crate::sources::FileRequest;
use crate::uri::file_name_of;

use super::{
    header, is_transient, DoneInfo, HandlerContext, Item, ItemCore, ItemDesc, ItemId, ItemKind,
    Outcome, VerifyError,
};

/// State of a plain file item.
#[derive(Debug, Clone)]
pub struct FileState {
    pub expected: HashString,
    /// Remaining retries for transient failures.
    pub retries: u32,
    pub is_index: bool,
}

pub(super) fn create(id: ItemId, request: FileRequest, ctx: &HandlerContext<'_>) -> (Item, Outcome) {
    let dest = match (&request.dest_filename, &request.dest_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => dir.join(file_name_of(&request.uri)),
        (None, None) => PathBuf::from(file_name_of(&request.uri)),
    };

    let desc = ItemDesc::new(&request.uri, &request.description, &request.short_desc);
    let mut core = ItemCore::new(id, desc, dest);
    core.file_size = request.size;

    // resume a smaller partial file, drop a bigger one
    if let Ok(meta) = fs::metadata(&core.dest_file) {
        if request.size > 0 && meta.len() > request.size {
            super::remove_quietly(&core.dest_file);
        } else {
            core.partial_size = meta.len();
        }
    }

    let mut out = Outcome::new();
    core.queue(&mut out);
    let state = FileState {
        expected: request.expected_hash,
        retries: ctx.config.retries,
        is_index: request.is_index,
    };
    (
        Item {
            core,
            kind: ItemKind::File(state),
        },
        out,
    )
}

impl FileState {
    pub(super) fn done(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        info: &DoneInfo,
        cnf: &MethodConfig,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        core.base_done(msg, info.size, out);

        if !self.expected.is_empty() && HashString::parse(&info.hash) != self.expected {
            core.rename_on_error(VerifyError::HashSumMismatch, out);
            return;
        }

        let filename = msg.get("Filename");
        if filename.is_empty() {
            core.fail_hard("Method gave a blank filename");
            return;
        }

        core.complete = true;
        if msg.lookup_bool("IMS-Hit", false) {
            return;
        }

        let source = PathBuf::from(filename);
        if source == core.dest_file {
            return;
        }

        // the method answered with a file it already had on disk
        core.local = true;
        if !ctx.config.source_symlinks || cnf.removable {
            core.desc.uri = format!("copy:{}", filename);
            core.queue(out);
            return;
        }

        super::remove_quietly(&core.dest_file);
        if let Err(e) = symlink(&source, &core.dest_file) {
            debug!(source = %source.display(), dest = %core.dest_file.display(), error = %e, "symlink failed");
            core.fail_hard(format!("Link to {} failure ", core.dest_file.display()));
            core.complete = false;
        }
    }

    pub(super) fn failed(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        cnf: &MethodConfig,
        _ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        core.error_text = msg.get("Message").to_string();

        if self.retries != 0 && !cnf.local_only && is_transient(msg) {
            self.retries -= 1;
            debug!(uri = %core.desc.uri, retries_left = self.retries, "retrying transient failure");
            core.queue(out);
            return;
        }

        core.base_failed(msg, cnf, out);
    }

    pub(super) fn custom_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if self.is_index {
            headers.push(header("Index-File", "true"));
        }
        if let Some(kind) = self.expected.hash_type() {
            if !self.expected.is_empty() {
                headers.push(header(&format!("Expected-{}", kind.name()), self.expected.value()));
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::hashes::{HashType, Hashes};
    use crate::item::{Action, ItemArena, ItemStatus};
    use crate::message::Message;
    use tempfile::TempDir;

    fn request(temp: &TempDir) -> FileRequest {
        FileRequest::new("http://example.org/pool/foo.dsc", "foo.dsc").with_dest_dir(temp.path())
    }

    #[test]
    fn test_create_queues_and_resumes_partial() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        fs::write(temp.path().join("foo.dsc"), b"12345").unwrap();
        let (item, out) = create(ItemId(0), request(&temp).with_size(10), &ctx);
        assert_eq!(item.core.partial_size, 5);
        assert_eq!(item.core.dest_file, temp.path().join("foo.dsc"));
        assert_eq!(out.enqueued().count(), 1);
    }

    #[test]
    fn test_create_drops_oversized_partial() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        fs::write(temp.path().join("foo.dsc"), b"too long for it").unwrap();
        let (item, _) = create(ItemId(0), request(&temp).with_size(4), &ctx);
        assert_eq!(item.core.partial_size, 0);
        assert!(!temp.path().join("foo.dsc").exists());
    }

    #[test]
    fn test_done_verifies_hash() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        let content = b"Format: 3.0\n";
        let good = Hashes::from_bytes(content).get(HashType::Sha256).to_string();
        let req = request(&temp).with_hash(HashString::new(HashType::Sha256, &good));
        let (mut item, _) = create(ItemId(0), req, &ctx);
        fs::write(&item.core.dest_file, content).unwrap();

        let info = DoneInfo {
            size: content.len() as u64,
            hash: format!("SHA256:{}", good),
        };
        item.done(&done_msg(&item), &info, &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Done);
        assert!(item.is_complete());

        let info = DoneInfo {
            size: content.len() as u64,
            hash: "SHA256:00".to_string(),
        };
        item.done(&done_msg(&item), &info, &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::AuthError);
        assert_eq!(item.error_text(), "Hash Sum mismatch");
        assert!(temp.path().join("foo.dsc.FAILED").exists());
    }

    #[test]
    fn test_done_symlinks_local_source() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        let source = temp.path().join("mirror-foo.dsc");
        fs::write(&source, b"x").unwrap();
        let (mut item, _) = create(ItemId(0), request(&temp), &ctx);
        let msg = Message::new(201, "URI Done").with("Filename", source.display().to_string());
        item.done(&msg, &DoneInfo::default(), &local(), &ctx);

        assert!(item.is_complete());
        assert!(item.core.local);
        let link = fs::read_link(item.dest_file()).unwrap();
        assert_eq!(link, source);
    }

    #[test]
    fn test_done_copies_from_removable_source() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        let (mut item, _) = create(ItemId(0), request(&temp), &ctx);
        let mut cnf = local();
        cnf.removable = true;
        let msg = Message::new(201, "URI Done").with("Filename", "/media/cdrom/foo.dsc");
        let out = item.done(&msg, &DoneInfo::default(), &cnf, &ctx);
        assert_eq!(item.desc().uri, "copy:/media/cdrom/foo.dsc");
        assert_eq!(out.enqueued().count(), 1);
    }

    #[test]
    fn test_failed_retries_transient_errors() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp).with_retries(1);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        let (mut item, _) = create(ItemId(0), request(&temp), &ctx);
        item.core.queue_counter = 1;
        let msg = failure_msg(&item, "Connection timed out").with("Transient-Failure", "true");

        let out = item.failed(&msg, &network(), &ctx);
        assert_eq!(out.enqueued().count(), 1);
        assert_ne!(item.status(), ItemStatus::Error);

        let out = item.failed(&msg, &network(), &ctx);
        assert_eq!(out.enqueued().count(), 0);
        assert_eq!(item.status(), ItemStatus::Error);
        assert!(out.actions.iter().any(|a| matches!(a, Action::Dequeue)));
    }

    #[test]
    fn test_index_header() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let req = request(&temp)
            .as_index()
            .with_hash(HashString::new(HashType::Sha256, "ab"));
        let (item, _) = create(ItemId(0), req, &ctx);
        let headers = item.custom_headers(&config);
        assert!(headers.contains(&("Index-File".to_string(), "true".to_string())));
        assert!(headers.contains(&("Expected-SHA256".to_string(), "ab".to_string())));
    }
}
