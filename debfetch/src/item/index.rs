//! Package and translation indexes, and sub-indexes.
//!
//! An index goes through up to two transfers on one item:
//!
//! ```text
//!   fetch <uri>.<ext> ──► decompress (<method>:<partial file>) ──► verify ──► rename
//!         │                     ▲
//!         └─ Alt-Filename ──────┘ (copy:<uncompressed file>)
//! ```
//!
//! A failed fetch moves on to the next compression extension. Translations
//! treat a missing file as "nothing to do".

use std::collections::VecDeque;
use std::fs;

use tracing::debug;

use crate::acquire::MethodConfig;
use crate::config::UNCOMPRESSED;
use crate::hashes::HashString;
use crate::message::Message;
use crate::release::ReleaseFile;
use crate::tagfile::read_first_section;

use super::{
    header, is_transient, last_modified, lists_file, lists_partial_file, make_readable,
    remove_quietly, with_suffix, DoneInfo, HandlerContext, IndexSpec, Item, ItemCore, ItemDesc,
    ItemId, ItemKind, ItemStatus, Outcome, VerifyError,
};

// =============================================================================
// Index
// =============================================================================

/// State of a package or translation index item.
#[derive(Debug, Clone)]
pub struct IndexState {
    /// URI of the uncompressed index; names the files on disk.
    pub real_uri: String,
    pub expected: HashString,
    /// Extensions still to try; the front one is in use.
    pub compression: VecDeque<String>,
    pub verify: bool,
    pub translation: bool,
    /// The current transfer is the decompression pass.
    pub decompression: bool,
    /// The downloaded compressed file is ours to delete.
    pub erase: bool,
}

pub(super) fn create_index(id: ItemId, spec: IndexSpec, ctx: &HandlerContext<'_>) -> (Item, Outcome) {
    let mut compression: VecDeque<String> = if spec.compression.is_empty() {
        ctx.config.compression_types().into()
    } else {
        spec.compression.into()
    };
    if compression.is_empty() {
        compression.push_back(UNCOMPRESSED.to_string());
    }

    let mut state = IndexState {
        real_uri: spec.desc.uri.clone(),
        expected: spec.expected,
        compression,
        verify: spec.verify,
        translation: spec.translation,
        decompression: false,
        erase: false,
    };
    let mut core = ItemCore::new(id, spec.desc, Default::default());
    let mut out = Outcome::new();
    state.init(&mut core, ctx, &mut out);
    (
        Item {
            core,
            kind: ItemKind::Index(state),
        },
        out,
    )
}

impl IndexState {
    fn current_ext(&self) -> &str {
        self.compression.front().map(String::as_str).unwrap_or(UNCOMPRESSED)
    }

    /// Point the item at the current extension and queue it.
    fn init(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) {
        self.decompression = false;
        self.erase = false;
        core.local = false;
        core.mode = None;
        core.dest_file = lists_partial_file(ctx.config, &self.real_uri);

        let ext = self.current_ext();
        core.desc.uri = if ext == UNCOMPRESSED {
            self.real_uri.clone()
        } else {
            format!("{}.{}", self.real_uri, ext)
        };
        debug!(uri = %core.desc.uri, "queueing index");
        core.queue(out);
    }

    pub(super) fn custom_headers(&self, core: &ItemCore, config: &crate::config::AcquireConfig) -> Vec<(String, String)> {
        let mut final_file = lists_file(config, &self.real_uri);
        let mut headers = Vec::new();
        if self.translation {
            headers.push(header("Fail-Ignore", "true"));
            headers.push(header("Index-File", "true"));
        } else {
            if config.gzip_indexes {
                final_file = with_suffix(&final_file, ".gz");
            }
            headers.push(header("Index-File", "true"));
            if !core.desc.short_desc.starts_with("Translation") {
                headers.push(header("Fail-Ignore", "true"));
            }
        }
        if let Some(time) = last_modified(&final_file) {
            headers.push(header("Last-Modified", time));
        }
        headers
    }

    pub(super) fn failed(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        cnf: &MethodConfig,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        if self.compression.len() > 1 {
            self.compression.pop_front();
            debug!(uri = %self.real_uri, next = self.current_ext(), "trying next compression");
            self.init(core, ctx, out);
            core.status = ItemStatus::Idle;
            return;
        }

        if self.translation && (cnf.local_only || !is_transient(msg)) {
            debug!(uri = %self.real_uri, "translation not available");
            core.finish_incomplete(out);
            return;
        }

        // a decompression failure leaves a bad download in partial/
        if self.decompression && self.erase {
            remove_quietly(&lists_partial_file(ctx.config, &self.real_uri));
        }

        core.base_failed(msg, cnf, out);
    }

    pub(super) fn done(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        info: &DoneInfo,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        core.base_done(msg, info.size, out);
        let config = ctx.config;

        if self.decompression {
            if !self.expected.is_empty() && HashString::parse(&info.hash) != self.expected {
                debug!(uri = %self.real_uri, computed = %info.hash, expected = %self.expected, "index hash mismatch");
                core.rename_on_error(VerifyError::HashSumMismatch, out);
                return;
            }

            // every index record has a Package field; an empty file is fine
            if self.verify {
                let size = fs::metadata(&core.dest_file).map(|m| m.len()).unwrap_or(0);
                if size > 0 {
                    let valid = matches!(
                        read_first_section(&core.dest_file),
                        Ok(Some(section)) if section.contains("Package")
                    );
                    if !valid {
                        core.rename_on_error(VerifyError::InvalidFormat, out);
                        return;
                    }
                }
            }

            let final_file = lists_file(config, &self.real_uri);
            let decompressed = core.dest_file.clone();
            if !core.rename(&decompressed, &final_file) {
                return;
            }
            make_readable(&final_file);

            // keep the partial name so that cleaning spares it
            core.dest_file = lists_partial_file(config, &self.real_uri);
            if self.erase {
                remove_quietly(&core.dest_file);
            }
            return;
        }

        self.erase = false;
        core.complete = true;

        let alt = msg.get("Alt-Filename");
        if !alt.is_empty() {
            if msg.lookup_bool("Alt-IMS-Hit", false) {
                return;
            }
            self.decompression = true;
            core.local = true;
            core.dest_file = with_suffix(&core.dest_file, ".decomp");
            core.desc.uri = format!("copy:{}", alt);
            core.mode = Some("copy".to_string());
            core.queue(out);
            return;
        }

        let filename = msg.get("Filename");
        if filename.is_empty() {
            core.fail_hard("Method gave a blank filename");
            return;
        }

        let ext = self.current_ext().to_string();
        if msg.lookup_bool("IMS-Hit", false) {
            if config.gzip_indexes && ext == "gz" {
                core.dest_file = with_suffix(&core.dest_file, ".gz");
            }
            return;
        }

        if std::path::Path::new(filename) == core.dest_file {
            self.erase = true;
        } else {
            core.local = true;
        }

        if config.gzip_indexes && ext == "gz" && !core.local {
            let final_file = with_suffix(&lists_file(config, &self.real_uri), ".gz");
            let downloaded = core.dest_file.clone();
            if !core.rename(&downloaded, &final_file) {
                return;
            }
            make_readable(&final_file);
            core.dest_file = with_suffix(&lists_partial_file(config, &self.real_uri), ".gz");
            return;
        }

        let Some(method) = config.decompress_method(&ext) else {
            core.fail_hard(format!("Unsupported extension: {}", ext));
            return;
        };
        let method = method.to_string();

        self.decompression = true;
        core.dest_file = with_suffix(&core.dest_file, ".decomp");
        core.desc.uri = format!("{}:{}", method, filename);
        core.mode = Some(method);
        core.queue(out);
    }
}

// =============================================================================
// Sub-index
// =============================================================================

/// State of a sub-index item.
#[derive(Debug, Clone)]
pub struct SubIndexState {
    pub real_uri: String,
    pub expected: HashString,
}

pub(super) fn create_sub_index(
    id: ItemId,
    desc: ItemDesc,
    expected: HashString,
    ctx: &HandlerContext<'_>,
) -> (Item, Outcome) {
    let dest = lists_partial_file(ctx.config, &desc.uri);
    let state = SubIndexState {
        real_uri: desc.uri.clone(),
        expected,
    };
    let core = ItemCore::new(id, desc, dest);
    let mut out = Outcome::new();
    core.queue(&mut out);
    (
        Item {
            core,
            kind: ItemKind::SubIndex(state),
        },
        out,
    )
}

impl SubIndexState {
    pub(super) fn custom_headers(&self, config: &crate::config::AcquireConfig) -> Vec<(String, String)> {
        let mut headers = vec![header("Index-File", "true"), header("Fail-Ignore", "true")];
        if let Some(time) = last_modified(&lists_file(config, &self.real_uri)) {
            headers.push(header("Last-Modified", time));
        }
        headers
    }

    pub(super) fn done(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        info: &DoneInfo,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        let filename = msg.get("Filename");
        if filename.is_empty() {
            core.fail_hard("Method gave a blank filename");
            return;
        }
        if std::path::Path::new(filename) != core.dest_file {
            core.local = true;
            core.desc.uri = format!("copy:{}", filename);
            core.queue(out);
            return;
        }

        core.base_done(msg, info.size, out);

        if !core.dest_file.exists() {
            core.finish_incomplete(out);
            return;
        }
        if let Err(e) = ReleaseFile::new("").load(&core.dest_file) {
            core.fail_hard(e.to_string());
            return;
        }

        let final_file = lists_file(ctx.config, &self.real_uri);
        let downloaded = core.dest_file.clone();
        if !core.rename(&downloaded, &final_file) {
            return;
        }
        make_readable(&final_file);
        core.dest_file = final_file;
        core.complete = true;
        core.status = ItemStatus::Done;
        out.dequeue();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::hashes::{HashType, Hashes};
    use crate::item::{Action, ItemArena, ItemSpec};
    use tempfile::TempDir;

    const URI: &str = "http://deb.example.org/debian/dists/sid/main/binary-amd64/Packages";

    fn spec(compression: &[&str]) -> IndexSpec {
        let mut spec = IndexSpec::new(
            ItemDesc::new(URI, "deb.example.org sid/main amd64 Packages", "Packages"),
            HashString::default(),
        );
        spec.compression = compression.iter().map(|s| s.to_string()).collect();
        spec
    }

    fn make(config: &crate::config::AcquireConfig, spec: IndexSpec) -> (Item, Outcome) {
        let arena = ItemArena::new();
        let ctx = HandlerContext { config, arena: &arena };
        only(Item::create(ItemId(0), ItemSpec::Index(spec), &ctx))
    }

    #[test]
    fn test_first_extension_is_queued() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let (item, out) = make(&config, spec(&["xz", "gz", "uncompressed"]));
        assert_eq!(item.desc().uri, format!("{}.xz", URI));
        assert_eq!(out.enqueued().count(), 1);
        assert!(item
            .dest_file()
            .ends_with("partial/deb.example.org_debian_dists_sid_main_binary-amd64_Packages"));
    }

    #[test]
    fn test_failure_moves_to_next_extension() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(&config, spec(&["xz", "uncompressed"]));
        item.core.queue_counter = 1;

        let out = item.failed(&failure_msg(&item, "404 Not Found"), &network(), &ctx);
        assert_eq!(item.desc().uri, URI);
        assert_eq!(item.status(), ItemStatus::Idle);
        assert_eq!(out.enqueued().count(), 1);

        item.failed(&failure_msg(&item, "404 Not Found"), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Error);
    }

    #[test]
    fn test_translation_failure_is_silent() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let mut spec = spec(&["uncompressed"]);
        spec.translation = true;
        spec.verify = false;
        let (mut item, _) = make(&config, spec);
        item.core.queue_counter = 1;

        item.failed(&failure_msg(&item, "404 Not Found"), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Done);
        assert!(!item.is_complete());
    }

    #[test]
    fn test_ims_hit_skips_decompression() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(&config, spec(&["gz"]));

        let msg = done_msg(&item).with("IMS-Hit", "true");
        let out = item.done(&msg, &DoneInfo::default(), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Done);
        assert!(item.is_complete());
        assert_eq!(out.enqueued().count(), 0);
        assert!(item.core.mode.is_none());
    }

    #[test]
    fn test_download_then_decompress_then_install() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };

        let content = b"Package: foo\nVersion: 1\n";
        let sha = Hashes::from_bytes(content).get(HashType::Sha256).to_string();
        let mut spec = spec(&["gz"]);
        spec.expected = HashString::new(HashType::Sha256, &sha);
        let (mut item, _) = make(&config, spec);

        let partial = item.dest_file().to_path_buf();
        fs::write(&partial, b"compressed bytes").unwrap();
        let out = item.done(&done_msg(&item), &DoneInfo::default(), &network(), &ctx);
        assert_eq!(item.core.mode.as_deref(), Some("gzip"));
        assert_eq!(item.desc().uri, format!("gzip:{}", partial.display()));
        assert_eq!(out.enqueued().count(), 1);

        fs::write(item.dest_file(), content).unwrap();
        let info = DoneInfo {
            size: content.len() as u64,
            hash: format!("SHA256:{}", sha),
        };
        item.done(&done_msg(&item), &info, &local(), &ctx);

        let final_file = lists_file(&config, URI);
        assert_eq!(fs::read(&final_file).unwrap(), content);
        assert_eq!(item.dest_file(), partial);
        assert!(!partial.exists(), "compressed download is erased");
        assert_eq!(item.status(), ItemStatus::Done);
    }

    #[test]
    fn test_decompressed_index_without_package_field_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(&config, spec(&["uncompressed"]));

        item.done(&done_msg(&item), &DoneInfo::default(), &network(), &ctx);
        assert_eq!(item.core.mode.as_deref(), Some("copy"));

        fs::write(item.dest_file(), b"<html>captive portal</html>\n").unwrap();
        let out = item.done(&done_msg(&item), &DoneInfo::default(), &local(), &ctx);
        assert_eq!(item.status(), ItemStatus::Error);
        assert_eq!(item.error_text(), "Invalid file format");
        assert!(!out.actions.iter().any(|a| matches!(a, Action::ReportMirrorFailure { .. })));
    }

    #[test]
    fn test_gzip_indexes_keeps_compressed_file() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp).with_gzip_indexes(true);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(&config, spec(&["gz"]));

        fs::write(item.dest_file(), b"gz").unwrap();
        let out = item.done(&done_msg(&item), &DoneInfo::default(), &network(), &ctx);
        assert_eq!(out.enqueued().count(), 0);
        assert!(with_suffix(&lists_file(&config, URI), ".gz").exists());
        assert!(item.dest_file().to_string_lossy().ends_with("Packages.gz"));
    }

    #[test]
    fn test_alt_filename_is_copied() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(&config, spec(&["gz"]));

        let msg = done_msg(&item).with("Alt-Filename", "/srv/mirror/Packages");
        item.done(&msg, &DoneInfo::default(), &local(), &ctx);
        assert_eq!(item.desc().uri, "copy:/srv/mirror/Packages");
        assert!(item.core.local);
    }

    #[test]
    fn test_unsupported_extension() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(&config, spec(&["zst"]));

        item.done(&done_msg(&item), &DoneInfo::default(), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Error);
        assert_eq!(item.error_text(), "Unsupported extension: zst");
    }

    #[test]
    fn test_headers_carry_last_modified() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let (item, _) = make(&config, spec(&["gz"]));
        assert!(!item
            .custom_headers(&config)
            .iter()
            .any(|(k, _)| k == "Last-Modified"));

        fs::write(lists_file(&config, URI), b"Package: a\n").unwrap();
        let headers = item.custom_headers(&config);
        assert!(headers.iter().any(|(k, _)| k == "Last-Modified"));
        assert!(headers.iter().any(|(k, _)| k == "Fail-Ignore"));
    }

    #[test]
    fn test_sub_index_installs_parsable_file() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let uri = "http://deb.example.org/debian/dists/sid/main/i18n/Index";
        let (mut item, _) = only(Item::create(
            ItemId(0),
            ItemSpec::SubIndex {
                desc: ItemDesc::new(uri, "i18n Index", "Index"),
                expected: HashString::default(),
            },
            &ctx,
        ));

        fs::write(
            item.dest_file(),
            "SHA1:\n da39a3ee5e6b4b0d3255bfef95601890afd80709 0 Translation-en\n",
        )
        .unwrap();
        item.done(&done_msg(&item), &DoneInfo::default(), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Done);
        assert!(item.is_complete());
        assert_eq!(item.dest_file(), lists_file(&config, uri));
    }

    #[test]
    fn test_sub_index_unparsable_file_is_not_installed() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let uri = "http://deb.example.org/debian/dists/sid/main/i18n/Index";
        let (mut item, _) = only(Item::create(
            ItemId(0),
            ItemSpec::SubIndex {
                desc: ItemDesc::new(uri, "i18n Index", "Index"),
                expected: HashString::default(),
            },
            &ctx,
        ));

        fs::write(item.dest_file(), "<html>captive portal</html>\n").unwrap();
        item.done(&done_msg(&item), &DoneInfo::default(), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Error);
        assert!(!item.is_complete());
        assert!(!lists_file(&config, uri).exists());
    }

    #[test]
    fn test_sub_index_failure_is_ignored() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = only(Item::create(
            ItemId(0),
            ItemSpec::SubIndex {
                desc: ItemDesc::new("http://h/Index", "Index", "Index"),
                expected: HashString::default(),
            },
            &ctx,
        ));
        item.failed(&failure_msg(&item, "404"), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Done);
        assert!(!item.is_complete());
    }
}
