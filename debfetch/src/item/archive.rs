//! Package archives, tried candidate by candidate.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::acquire::MethodConfig;
use crate::hashes::HashString;
use crate::message::Message;
use crate::sources::{PackageVersion, VersionFile};
use crate::uri::quote_string;

use super::{
    header, is_transient, remove_quietly, DoneInfo, HandlerContext, Item, ItemCore, ItemDesc,
    ItemId, ItemKind, ItemStatus, Outcome, VerifyError,
};

/// State of a package archive item.
#[derive(Debug, Clone)]
pub struct ArchiveState {
    pub version: PackageVersion,
    pub expected: HashString,
    /// Where the archive ends up. `None` once the item has no usable file.
    pub store: Option<PathBuf>,
    /// Only trusted candidates are acceptable.
    pub trusted: bool,
    /// Next candidate in `version.files`.
    next: usize,
    retries: u32,
    store_name: String,
}

/// `name_version_arch.ext` with the separators quoted.
pub fn store_name(version: &PackageVersion, file_name: &str) -> String {
    let ext = file_name.rsplit('.').next().unwrap_or(file_name);
    format!(
        "{}_{}_{}.{}",
        quote_string(&version.name, "_:"),
        quote_string(&version.version, "_:"),
        quote_string(&version.arch, "_:."),
        ext
    )
}

fn is_candidate(file: &VersionFile) -> bool {
    !file.not_source && file.index.is_some()
}

pub(super) fn create(id: ItemId, version: PackageVersion, ctx: &HandlerContext<'_>) -> (Item, Outcome) {
    let config = ctx.config;
    let desc = ItemDesc::new("", "", &version.name);
    let mut core = ItemCore::new(id, desc, PathBuf::new());
    let mut out = Outcome::new();

    let mut state = ArchiveState {
        expected: HashString::default(),
        store: None,
        trusted: false,
        next: 0,
        retries: config.retries,
        store_name: String::new(),
        version,
    };

    if state.version.arch.is_empty() {
        core.fail_hard(format!(
            "I wasn't able to locate a file for the {} package. This might mean you need to manually fix this package. (due to missing arch)",
            state.version.name
        ));
        return (wrap(core, state), out);
    }

    // all candidates are assumed to share one extension
    if let Some(record) = state
        .version
        .files
        .iter()
        .find(|f| !f.not_source)
        .and_then(|f| f.record.as_ref())
    {
        state.store_name = store_name(&state.version, &record.filename);
    }

    // once one trusted source exists, only trusted sources will do
    let mut seen_untrusted = false;
    for index in state.version.files.iter().filter_map(|f| f.index.as_ref()) {
        debug!(index = %index.label, trusted = index.trusted, "checking index");
        if index.trusted {
            state.trusted = true;
            if !config.allow_unauthenticated {
                break;
            }
        } else {
            seen_untrusted = true;
        }
    }
    // first listed wins, untrusted local sources included
    if config.allow_unauthenticated && seen_untrusted {
        state.trusted = false;
    }

    match state.queue_next(&mut core, ctx, &mut out) {
        Ok(true) => {}
        Ok(false) => core.fail_hard(format!(
            "Can't find a source to download version '{}' of '{}'",
            state.version.version, state.version.name
        )),
        Err(text) => core.fail_hard(text),
    }
    (wrap(core, state), out)
}

fn wrap(core: ItemCore, state: ArchiveState) -> Item {
    Item {
        core,
        kind: ItemKind::Archive(state),
    }
}

/// Accept an already cached file of the right size, drop a wrong one.
fn cached(path: &Path, size: u64) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == size => true,
        Ok(_) => {
            remove_quietly(path);
            false
        }
        Err(_) => false,
    }
}

impl ArchiveState {
    /// Whether the chosen source is trusted.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn finish_local(&mut self, core: &mut ItemCore, path: PathBuf) {
        core.complete = true;
        core.local = true;
        core.status = ItemStatus::Done;
        core.dest_file = path.clone();
        self.store = Some(path);
    }

    /// Queue the next usable candidate. `Err` means the index data is broken.
    fn queue_next(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) -> Result<bool, String> {
        let config = ctx.config;
        while self.next < self.version.files.len() {
            let file = &self.version.files[self.next];
            if !is_candidate(file) {
                self.next += 1;
                continue;
            }
            let Some(index) = file.index.as_ref() else {
                self.next += 1;
                continue;
            };
            if self.trusted && !index.trusted {
                self.next += 1;
                continue;
            }

            let record = file.record.clone().unwrap_or_default();
            self.expected = record.expected_hash(config.force_hash);
            if record.filename.is_empty() {
                return Err(format!(
                    "The package index files are corrupted. No Filename: field for package {}.",
                    self.version.name
                ));
            }

            core.desc = ItemDesc::new(
                format!("{}{}", index.base_uri, record.filename),
                format!(
                    "{} {} {} {}",
                    index.label, self.version.name, self.version.arch, self.version.version
                ),
                &self.version.name,
            );
            core.file_size = self.version.size;

            let base_name = record.filename.rsplit('/').next().unwrap_or(&record.filename);
            let legacy = config.archives_dir.join(base_name);
            if cached(&legacy, self.version.size) {
                debug!(path = %legacy.display(), "archive already cached");
                self.finish_local(core, legacy);
                return Ok(true);
            }
            let final_file = config.archives_dir.join(&self.store_name);
            if cached(&final_file, self.version.size) {
                debug!(path = %final_file.display(), "archive already cached");
                self.finish_local(core, final_file);
                return Ok(true);
            }

            core.dest_file = config.archives_partial_dir().join(&self.store_name);
            core.partial_size = 0;
            if let Ok(meta) = fs::metadata(&core.dest_file) {
                if meta.len() > self.version.size {
                    remove_quietly(&core.dest_file);
                } else {
                    core.partial_size = meta.len();
                }
            }

            if config.archives_no_queue {
                self.finish_local(core, final_file);
                return Ok(true);
            }

            core.local = false;
            core.status = ItemStatus::Idle;
            self.store = Some(final_file);
            core.queue(out);
            self.next += 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub(super) fn custom_headers(&self) -> Vec<(String, String)> {
        match self.expected.hash_type() {
            Some(kind) if !self.expected.is_empty() => {
                vec![header(&format!("Expected-{}", kind.name()), self.expected.value())]
            }
            _ => Vec::new(),
        }
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

        let mismatch = if info.size != self.version.size {
            Some(VerifyError::SizeMismatch)
        } else if !self.expected.is_empty() && HashString::parse(&info.hash) != self.expected {
            Some(VerifyError::HashSumMismatch)
        } else {
            None
        };
        if let Some(error) = mismatch {
            core.rename_on_error(error, out);
            let (status, text) = (core.status, core.error_text.clone());
            match self.queue_next(core, ctx, out) {
                Ok(true) => {
                    warn!(package = %self.version.name, error = %text, "trying next source");
                }
                _ => {
                    core.status = status;
                    core.error_text = text;
                    self.store = None;
                }
            }
            return;
        }

        let filename = msg.get("Filename");
        if filename.is_empty() {
            core.fail_hard("Method gave a blank filename");
            return;
        }

        core.complete = true;

        // the method handed us a file it keeps itself
        if Path::new(filename) != core.dest_file {
            core.dest_file = PathBuf::from(filename);
            self.store = Some(core.dest_file.clone());
            core.local = true;
            return;
        }

        let final_file = ctx.config.archives_dir.join(&self.store_name);
        let downloaded = core.dest_file.clone();
        core.rename(&downloaded, &final_file);
        core.dest_file = final_file.clone();
        self.store = Some(final_file);
    }

    pub(super) fn failed(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        cnf: &MethodConfig,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        core.error_text = msg.get("Message").to_string();

        // no automatic media swaps
        if cnf.removable && is_transient(msg) {
            self.next = self.version.files.len();
            self.store = None;
            core.base_failed(msg, cnf, out);
            return;
        }

        let mut queued = self.queue_next(core, ctx, out);
        if matches!(queued, Ok(false)) && self.retries != 0 && !cnf.local_only && is_transient(msg) {
            self.retries -= 1;
            self.next = 0;
            debug!(package = %self.version.name, retries_left = self.retries, "restarting from the first source");
            queued = self.queue_next(core, ctx, out);
        }

        match queued {
            Ok(true) => {}
            Ok(false) => {
                self.store = None;
                core.base_failed(msg, cnf, out);
            }
            Err(text) => {
                self.store = None;
                core.fail_hard(text);
                out.dequeue();
            }
        }
    }

    /// End of run: an incomplete archive has no file to offer.
    pub(super) fn finished(&mut self, core: &ItemCore) {
        if core.status == ItemStatus::Done && core.complete {
            return;
        }
        self.store = None;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::AcquireConfig;
    use crate::hashes::{HashType, Hashes};
    use crate::item::{ItemArena, ItemSpec};
    use crate::sources::{ArchiveIndex, PackageRecord};
    use tempfile::TempDir;

    const DEB: &[u8] = b"!<arch>\ndebian-binary\n";

    fn index(base: &str, trusted: bool) -> ArchiveIndex {
        ArchiveIndex {
            base_uri: base.to_string(),
            trusted,
            label: format!("{} sid/main", base),
        }
    }

    fn record() -> PackageRecord {
        let hashes = Hashes::from_bytes(DEB);
        PackageRecord::new("pool/main/f/foo/foo_1.0-1_amd64.deb")
            .with_hash(HashType::Md5Sum, hashes.get(HashType::Md5Sum))
            .with_hash(HashType::Sha512, hashes.get(HashType::Sha512))
    }

    fn version(files: Vec<VersionFile>) -> PackageVersion {
        PackageVersion {
            name: "foo".to_string(),
            version: "1:1.0-1".to_string(),
            arch: "amd64".to_string(),
            size: DEB.len() as u64,
            files,
        }
    }

    fn make(config: &AcquireConfig, version: PackageVersion) -> (Item, Outcome) {
        let arena = ItemArena::new();
        let ctx = HandlerContext { config, arena: &arena };
        only(Item::create(ItemId(0), ItemSpec::Archive(version), &ctx))
    }

    fn state(item: &Item) -> &ArchiveState {
        match &item.kind {
            ItemKind::Archive(s) => s,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_store_name_quotes_separators() {
        let v = version(Vec::new());
        assert_eq!(store_name(&v, "pool/foo_1.0-1_amd64.deb"), "foo_1%3a1.0-1_amd64.deb");
    }

    #[test]
    fn test_strongest_hash_is_expected() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let (item, out) = make(
            &config,
            version(vec![VersionFile::new(index("http://deb.example.org/debian/", true), record())]),
        );
        assert_eq!(
            item.desc().uri,
            "http://deb.example.org/debian/pool/main/f/foo/foo_1.0-1_amd64.deb"
        );
        assert_eq!(out.enqueued().count(), 1);
        assert_eq!(state(&item).expected.hash_type(), Some(HashType::Sha512));
        let headers = item.custom_headers(&config);
        assert_eq!(headers[0].0, "Expected-SHA512");
        assert_eq!(item.dest_file(), config.archives_partial_dir().join("foo_1%3a1.0-1_amd64.deb"));
    }

    #[test]
    fn test_cached_archive_is_not_fetched() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let cached = config.archives_dir.join("foo_1%3a1.0-1_amd64.deb");
        fs::write(&cached, DEB).unwrap();

        let (item, out) = make(
            &config,
            version(vec![VersionFile::new(index("http://deb.example.org/debian/", true), record())]),
        );
        assert_eq!(out.enqueued().count(), 0);
        assert_eq!(item.status(), ItemStatus::Done);
        assert!(item.is_complete());
        assert_eq!(state(&item).store.as_deref(), Some(cached.as_path()));
    }

    #[test]
    fn test_trusted_source_preferred() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let files = vec![
            VersionFile::new(index("file:/srv/local/", false), record()),
            VersionFile::new(index("http://deb.example.org/debian/", true), record()),
        ];
        let (item, _) = make(&config, version(files.clone()));
        assert!(state(&item).is_trusted());
        assert!(item.desc().uri.starts_with("http://deb.example.org/"));

        // allow-unauthenticated: the first listed source wins
        let config = config.with_allow_unauthenticated(true);
        let (item, _) = make(&config, version(files));
        assert!(!state(&item).is_trusted());
        assert!(item.desc().uri.starts_with("file:/srv/local/"));
    }

    #[test]
    fn test_failure_moves_to_next_candidate_then_retries() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp).with_retries(1);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let files = vec![
            VersionFile::new(index("http://a.example.org/", true), record()),
            VersionFile::new(index("http://b.example.org/", true), record()),
        ];
        let (mut item, _) = make(&config, version(files));
        item.core.queue_counter = 1;
        let transient = |item: &Item| failure_msg(item, "timeout").with("Transient-Failure", "true");

        let out = item.failed(&transient(&item), &network(), &ctx);
        assert!(item.desc().uri.starts_with("http://b.example.org/"));
        assert_eq!(out.enqueued().count(), 1);

        // out of candidates: one retry round from the top
        let out = item.failed(&transient(&item), &network(), &ctx);
        assert!(item.desc().uri.starts_with("http://a.example.org/"));
        assert_eq!(out.enqueued().count(), 1);

        item.failed(&transient(&item), &network(), &ctx);
        item.failed(&transient(&item), &network(), &ctx);
        assert_eq!(item.status(), ItemStatus::Error);
        item.retire(&config);
        assert!(state(&item).store.is_none());
    }

    #[test]
    fn test_removable_transient_failure_is_final() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp).with_retries(3);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let files = vec![
            VersionFile::new(index("cdrom:[Debian]/", true), record()),
            VersionFile::new(index("http://b.example.org/", true), record()),
        ];
        let (mut item, _) = make(&config, version(files));
        item.core.queue_counter = 1;

        let mut cnf = local();
        cnf.removable = true;
        cnf.local_only = false;
        let msg = failure_msg(&item, "Please insert disc").with("Transient-Failure", "true");
        let out = item.failed(&msg, &cnf, &ctx);
        assert_eq!(out.enqueued().count(), 0);
        assert_eq!(item.status(), ItemStatus::Error);
    }

    #[test]
    fn test_size_mismatch_tries_next_candidate() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let files = vec![
            VersionFile::new(index("http://a.example.org/", true), record()),
            VersionFile::new(index("http://b.example.org/", true), record()),
        ];
        let (mut item, _) = make(&config, version(files));
        fs::write(item.dest_file(), b"short").unwrap();

        let info = DoneInfo { size: 5, hash: String::new() };
        let out = item.done(&done_msg(&item), &info, &network(), &ctx);
        assert!(config.archives_partial_dir().join("foo_1%3a1.0-1_amd64.deb.FAILED").exists());
        assert!(item.desc().uri.starts_with("http://b.example.org/"));
        assert_eq!(out.enqueued().count(), 1);
        assert_eq!(item.status(), ItemStatus::Idle);
    }

    #[test]
    fn test_done_moves_archive_into_cache() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let arena = ItemArena::new();
        let ctx = HandlerContext { config: &config, arena: &arena };
        let (mut item, _) = make(
            &config,
            version(vec![VersionFile::new(index("http://a.example.org/", true), record())]),
        );
        fs::write(item.dest_file(), DEB).unwrap();

        let info = DoneInfo {
            size: DEB.len() as u64,
            hash: format!("SHA512:{}", Hashes::from_bytes(DEB).get(HashType::Sha512)),
        };
        item.done(&done_msg(&item), &info, &network(), &ctx);
        let final_file = config.archives_dir.join("foo_1%3a1.0-1_amd64.deb");
        assert_eq!(item.status(), ItemStatus::Done);
        assert_eq!(fs::read(&final_file).unwrap(), DEB);
        item.retire(&config);
        assert_eq!(state(&item).store.as_deref(), Some(final_file.as_path()));
    }

    #[test]
    fn test_missing_arch_and_missing_sources() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);

        let mut v = version(Vec::new());
        v.arch.clear();
        let (item, _) = make(&config, v);
        assert_eq!(item.status(), ItemStatus::Error);
        assert!(item.error_text().starts_with("I wasn't able to locate a file for the foo package."));

        let (item, _) = make(&config, version(Vec::new()));
        assert_eq!(
            item.error_text(),
            "Can't find a source to download version '1:1.0-1' of 'foo'"
        );

        let mut broken = record();
        broken.filename.clear();
        let (item, _) = make(
            &config,
            version(vec![VersionFile::new(index("http://a.example.org/", true), broken)]),
        );
        assert!(item.error_text().starts_with("The package index files are corrupted."));
    }

    #[test]
    fn test_no_queue_marks_complete() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp).with_archives_no_queue(true);
        let (item, out) = make(
            &config,
            version(vec![VersionFile::new(index("http://a.example.org/", true), record())]),
        );
        assert_eq!(out.enqueued().count(), 0);
        assert!(item.is_complete());
    }
}
