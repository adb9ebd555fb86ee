//! Fetch items and their state machines.
//!
//! An item owns exactly one destination file and knows how to advance it:
//! which URI to queue next, what to check when a transfer finishes, which
//! successor items to create. Items live in an [`ItemArena`] owned by the
//! engine and are addressed by [`ItemId`].
//!
//! Handlers never reach into the engine. They mutate the item and describe
//! everything else in the returned [`Outcome`]:
//!
//! ```text
//!   worker message ──► engine ──► Item::done / Item::failed
//!                                      │
//!                                      ▼
//!                 Outcome { Enqueue, Dequeue, Spawn(ItemSpec), Warning, .. }
//!                                      │
//!                  engine applies actions in order after the handler
//! ```
//!
//! Kinds that share the file-level rules (rename into place, move bad files
//! aside, mirror reporting) get them from [`ItemCore`]; everything specific
//! lives in the kind's state inside [`ItemKind`].

mod archive;
mod arena;
mod diffs;
mod file;
mod index;
mod meta;

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::acquire::MethodConfig;
use crate::config::AcquireConfig;
use crate::hashes::HashString;
use crate::message::Message;
use crate::pdiff::DiffInfo;
use crate::sources::{FileRequest, IndexTarget, PackageVersion};
use crate::uri::{time_rfc1123, uri_to_file_name};

pub use archive::ArchiveState;
pub use arena::ItemArena;
pub use diffs::{DiffIndexState, IndexDiffsState, MergeDiffsState, MergeState, PatchState};
pub use file::FileState;
pub use index::{IndexState, SubIndexState};
pub use meta::{MetaIndexState, MetaSigState, ReleaseChain};

// =============================================================================
// Identity and status
// =============================================================================

/// Stable handle of an item in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub usize);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an item is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemStatus {
    #[default]
    Idle,
    Fetching,
    Done,
    Error,
    AuthError,
    TransientNetworkError,
}

impl ItemStatus {
    /// Statuses reported as failures in the run summary.
    pub fn is_failure(&self) -> bool {
        matches!(self, ItemStatus::Error | ItemStatus::AuthError)
    }
}

/// A URI to fetch and how to describe it to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemDesc {
    pub uri: String,
    pub description: String,
    pub short_desc: String,
}

impl ItemDesc {
    pub fn new(
        uri: impl Into<String>,
        description: impl Into<String>,
        short_desc: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            description: description.into(),
            short_desc: short_desc.into(),
        }
    }
}

/// Why a finished file was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    HashSumMismatch,
    SizeMismatch,
    InvalidFormat,
}

// =============================================================================
// Outcome
// =============================================================================

/// Something a handler asks the engine to do.
#[derive(Debug, Clone)]
pub enum Action {
    /// Put the item in the queue for this URI.
    Enqueue(ItemDesc),
    /// Remove the item from every queue.
    Dequeue,
    /// Create successor items.
    Spawn(ItemSpec),
    /// User-visible warning for the run summary.
    Warning(String),
    /// Tell the mirror report script about a failure.
    ReportMirrorFailure {
        used_mirror: String,
        uri: String,
        code: String,
    },
    /// Run the configured auth-failure hooks.
    RunAuthFailureHooks,
    /// Bytes moved over the network for this item.
    Fetched { bytes: u64, resume_point: u64 },
}

/// Actions collected during one handler call, applied in order.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub actions: Vec<Action>,
}

impl Outcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, desc: ItemDesc) {
        self.actions.push(Action::Enqueue(desc));
    }

    pub fn dequeue(&mut self) {
        self.actions.push(Action::Dequeue);
    }

    pub fn spawn(&mut self, spec: ItemSpec) {
        self.actions.push(Action::Spawn(spec));
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        let text = text.into();
        warn!("{}", text);
        self.actions.push(Action::Warning(text));
    }

    /// Spawned specs, in order.
    pub fn spawned(&self) -> impl Iterator<Item = &ItemSpec> {
        self.actions.iter().filter_map(|a| match a {
            Action::Spawn(spec) => Some(spec),
            _ => None,
        })
    }

    /// URIs queued, in order.
    pub fn enqueued(&self) -> impl Iterator<Item = &ItemDesc> {
        self.actions.iter().filter_map(|a| match a {
            Action::Enqueue(desc) => Some(desc),
            _ => None,
        })
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match a {
            Action::Warning(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

// =============================================================================
// Item specs
// =============================================================================

/// A plain or translation index fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// `uri` is the uncompressed index URI.
    pub desc: ItemDesc,
    pub expected: HashString,
    /// Compression extensions to try, in order. Empty means the configured list.
    pub compression: Vec<String>,
    /// Require a `Package` field in the first record.
    pub verify: bool,
    /// Missing translations are not errors.
    pub translation: bool,
}

impl IndexSpec {
    pub fn new(desc: ItemDesc, expected: HashString) -> Self {
        Self {
            desc,
            expected,
            compression: Vec::new(),
            verify: true,
            translation: false,
        }
    }
}

/// A patch chain for one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffChainSpec {
    /// `uri` is the index being patched.
    pub desc: ItemDesc,
    pub expected: HashString,
    pub server_sha1: String,
    pub patches: Vec<DiffInfo>,
}

/// Everything needed to create an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSpec {
    File(FileRequest),
    Index(IndexSpec),
    SubIndex { desc: ItemDesc, expected: HashString },
    /// `desc.uri` is the index the diff index belongs to.
    DiffIndex { desc: ItemDesc, expected: HashString },
    IndexDiffs(DiffChainSpec),
    /// One item per patch, all sharing a sibling list.
    MergeDiffs(DiffChainSpec),
    MetaSig { signature: ItemDesc, chain: ReleaseChain },
    MetaIndex { chain: ReleaseChain, sig_file: Option<PathBuf> },
    MetaClearSig { inrelease: ItemDesc, chain: ReleaseChain },
    Archive(PackageVersion),
}

impl ItemSpec {
    /// Index spec for a release target.
    pub fn index_for_target(target: &IndexTarget, expected: HashString, compression: Vec<String>) -> Self {
        ItemSpec::Index(IndexSpec {
            desc: ItemDesc::new(&target.uri, &target.description, &target.short_desc),
            expected,
            compression,
            verify: !target.optional,
            translation: target.optional,
        })
    }
}

// =============================================================================
// Item
// =============================================================================

/// Read-only view of the world a handler gets.
pub struct HandlerContext<'a> {
    pub config: &'a AcquireConfig,
    /// Every other item. The item being handled is not in it.
    pub arena: &'a ItemArena,
}

/// What a worker reported with a finished transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoneInfo {
    pub size: u64,
    /// `Type:value` of the received file in the item's expected family, or empty.
    pub hash: String,
}

/// Fields every kind shares.
#[derive(Debug, Clone)]
pub struct ItemCore {
    pub id: ItemId,
    /// The URI currently queued.
    pub desc: ItemDesc,
    pub dest_file: PathBuf,
    pub status: ItemStatus,
    pub file_size: u64,
    pub partial_size: u64,
    /// The logical artifact is ready, not just the last transfer.
    pub complete: bool,
    /// The current transfer is a local operation.
    pub local: bool,
    /// Queue entries referring to this item. Maintained by the engine.
    pub queue_counter: usize,
    pub error_text: String,
    pub used_mirror: String,
    /// Local sub-phase in progress (`rred`, `gpgv`, a decompressor).
    pub mode: Option<String>,
}

/// Kind-specific state.
#[derive(Debug, Clone)]
pub enum ItemKind {
    File(FileState),
    Index(IndexState),
    SubIndex(SubIndexState),
    DiffIndex(DiffIndexState),
    IndexDiffs(IndexDiffsState),
    MergeDiffs(MergeDiffsState),
    MetaSig(MetaSigState),
    MetaIndex(MetaIndexState),
    Archive(ArchiveState),
}

/// One unit of fetch work.
#[derive(Debug, Clone)]
pub struct Item {
    pub core: ItemCore,
    pub kind: ItemKind,
}

impl Item {
    /// Build the items described by `spec`, numbering them from `first`.
    ///
    /// Every kind yields one item except merged diffs, which yield one per
    /// patch. Constructors may already have finished (a diff index without
    /// a local file falls back immediately) and report so in the outcome.
    pub fn create(first: ItemId, spec: ItemSpec, ctx: &HandlerContext<'_>) -> Vec<(Item, Outcome)> {
        match spec {
            ItemSpec::File(request) => vec![file::create(first, request, ctx)],
            ItemSpec::Index(spec) => vec![index::create_index(first, spec, ctx)],
            ItemSpec::SubIndex { desc, expected } => {
                vec![index::create_sub_index(first, desc, expected, ctx)]
            }
            ItemSpec::DiffIndex { desc, expected } => {
                vec![diffs::create_diff_index(first, desc, expected, ctx)]
            }
            ItemSpec::IndexDiffs(chain) => vec![diffs::create_index_diffs(first, chain, ctx)],
            ItemSpec::MergeDiffs(chain) => diffs::create_merge_diffs(first, chain, ctx),
            ItemSpec::MetaSig { signature, chain } => {
                vec![meta::create_meta_sig(first, signature, chain, ctx)]
            }
            ItemSpec::MetaIndex { chain, sig_file } => {
                vec![meta::create_meta_index(first, chain, sig_file, ctx)]
            }
            ItemSpec::MetaClearSig { inrelease, chain } => {
                vec![meta::create_meta_clearsig(first, inrelease, chain, ctx)]
            }
            ItemSpec::Archive(version) => vec![archive::create(first, version, ctx)],
        }
    }

    pub fn id(&self) -> ItemId {
        self.core.id
    }

    pub fn status(&self) -> ItemStatus {
        self.core.status
    }

    pub fn desc(&self) -> &ItemDesc {
        &self.core.desc
    }

    pub fn dest_file(&self) -> &Path {
        &self.core.dest_file
    }

    pub fn is_complete(&self) -> bool {
        self.core.complete
    }

    pub fn error_text(&self) -> &str {
        &self.core.error_text
    }

    /// Short name of the kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ItemKind::File(_) => "file",
            ItemKind::Index(s) if s.translation => "index-trans",
            ItemKind::Index(_) => "index",
            ItemKind::SubIndex(_) => "sub-index",
            ItemKind::DiffIndex(_) => "diff-index",
            ItemKind::IndexDiffs(_) => "index-diffs",
            ItemKind::MergeDiffs(_) => "merge-diffs",
            ItemKind::MetaSig(_) => "meta-sig",
            ItemKind::MetaIndex(s) if s.is_clearsigned() => "meta-clearsig",
            ItemKind::MetaIndex(_) => "meta-index",
            ItemKind::Archive(_) => "archive",
        }
    }

    /// The hash the finished transfer is compared against, if any.
    pub fn expected_hash(&self) -> Option<&HashString> {
        let hash = match &self.kind {
            ItemKind::File(s) => &s.expected,
            ItemKind::Index(s) => &s.expected,
            ItemKind::SubIndex(s) => &s.expected,
            ItemKind::DiffIndex(s) => &s.expected,
            ItemKind::IndexDiffs(s) => &s.expected,
            ItemKind::MergeDiffs(s) => &s.expected,
            ItemKind::Archive(s) => &s.expected,
            ItemKind::MetaSig(_) | ItemKind::MetaIndex(_) => return None,
        };
        (!hash.is_empty()).then_some(hash)
    }

    /// The transfer reported a size and started.
    pub fn start(&mut self, size: u64) {
        self.core.status = ItemStatus::Fetching;
        if self.core.file_size == 0 && !self.core.complete {
            self.core.file_size = size;
        }
    }

    /// A transfer for this item finished.
    pub fn done(
        &mut self,
        msg: &Message,
        info: &DoneInfo,
        cnf: &MethodConfig,
        ctx: &HandlerContext<'_>,
    ) -> Outcome {
        let mut out = Outcome::new();
        let core = &mut self.core;
        match &mut self.kind {
            ItemKind::File(s) => s.done(core, msg, info, cnf, ctx, &mut out),
            ItemKind::Index(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::SubIndex(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::DiffIndex(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::IndexDiffs(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::MergeDiffs(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::MetaSig(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::MetaIndex(s) => s.done(core, msg, info, ctx, &mut out),
            ItemKind::Archive(s) => s.done(core, msg, info, ctx, &mut out),
        }
        debug!(item = %self.core.id, kind = self.kind_name(), status = ?self.core.status, "done handled");
        out
    }

    /// A transfer for this item failed.
    ///
    /// A transfer that was running counts as finished before the handler
    /// runs, and network-level failures mark the item transient so that
    /// kinds holding trust state can tell them apart.
    pub fn failed(&mut self, msg: &Message, cnf: &MethodConfig, ctx: &HandlerContext<'_>) -> Outcome {
        let mut out = Outcome::new();
        if self.core.status == ItemStatus::Fetching {
            self.core.status = ItemStatus::Done;
        }
        if is_network_failure(msg) {
            self.core.status = ItemStatus::TransientNetworkError;
        }
        let core = &mut self.core;
        match &mut self.kind {
            ItemKind::File(s) => s.failed(core, msg, cnf, ctx, &mut out),
            ItemKind::Index(s) => s.failed(core, msg, cnf, ctx, &mut out),
            ItemKind::SubIndex(_) => core.finish_incomplete(&mut out),
            ItemKind::DiffIndex(s) => s.failed(core, &mut out),
            ItemKind::IndexDiffs(s) => s.failed(core, &mut out),
            ItemKind::MergeDiffs(s) => s.failed(core, ctx, &mut out),
            ItemKind::MetaSig(s) => s.failed(core, msg, cnf, ctx, &mut out),
            ItemKind::MetaIndex(s) => s.failed(core, msg, cnf, ctx, &mut out),
            ItemKind::Archive(s) => s.failed(core, msg, cnf, ctx, &mut out),
        }
        debug!(item = %self.core.id, kind = self.kind_name(), status = ?self.core.status, "failure handled");
        out
    }

    /// Extra fields for the `600 URI Acquire` request.
    pub fn custom_headers(&self, config: &AcquireConfig) -> Vec<(String, String)> {
        match &self.kind {
            ItemKind::File(s) => s.custom_headers(),
            ItemKind::Index(s) => s.custom_headers(&self.core, config),
            ItemKind::SubIndex(s) => s.custom_headers(config),
            ItemKind::DiffIndex(s) => s.custom_headers(config),
            ItemKind::IndexDiffs(_) | ItemKind::MergeDiffs(_) => Vec::new(),
            ItemKind::MetaSig(s) => s.custom_headers(),
            ItemKind::MetaIndex(s) => s.custom_headers(&self.core, config),
            ItemKind::Archive(s) => s.custom_headers(),
        }
    }

    /// End-of-run hook, called once for every item after the run loop.
    pub fn retire(&mut self, config: &AcquireConfig) {
        match &mut self.kind {
            ItemKind::MetaSig(s) => s.retire(&mut self.core, config),
            ItemKind::MetaIndex(s) => s.retire(&mut self.core, config),
            ItemKind::Archive(s) => s.finished(&self.core),
            _ => {}
        }
    }
}

// =============================================================================
// Shared item behaviour
// =============================================================================

impl ItemCore {
    pub(crate) fn new(id: ItemId, desc: ItemDesc, dest_file: PathBuf) -> Self {
        Self {
            id,
            desc,
            dest_file,
            status: ItemStatus::Idle,
            file_size: 0,
            partial_size: 0,
            complete: false,
            local: false,
            queue_counter: 0,
            error_text: String::new(),
            used_mirror: String::new(),
            mode: None,
        }
    }

    /// Queue the current description.
    pub(crate) fn queue(&self, out: &mut Outcome) {
        out.enqueue(self.desc.clone());
    }

    /// Stop without a usable artifact, but without an error either.
    pub(crate) fn finish_incomplete(&mut self, out: &mut Outcome) {
        self.complete = false;
        self.status = ItemStatus::Done;
        out.dequeue();
    }

    pub(crate) fn fail_hard(&mut self, text: impl Into<String>) {
        self.status = ItemStatus::Error;
        self.error_text = text.into();
    }

    /// Bookkeeping shared by every successful transfer.
    pub(crate) fn base_done(&mut self, msg: &Message, size: u64, out: &mut Outcome) {
        let filename = msg.get("Filename");
        self.used_mirror = msg.get("UsedMirror").to_string();
        if !self.complete && !self.local && Path::new(filename) == self.dest_file {
            out.actions.push(Action::Fetched {
                bytes: size,
                resume_point: msg.lookup_u64("Resume-Point"),
            });
        }

        if self.file_size == 0 {
            self.file_size = size;
        }
        self.status = ItemStatus::Done;
        self.error_text.clear();
        out.dequeue();
    }

    /// Decide between idle-retry-later and a terminal error.
    ///
    /// The item stays idle while other queues still hold it. Local-only
    /// sources reporting a transient failure go idle as well, to be retried
    /// on a later run.
    pub(crate) fn base_failed(&mut self, msg: &Message, cnf: &MethodConfig, out: &mut Outcome) {
        self.status = ItemStatus::Idle;
        self.error_text = msg.get("Message").to_string();
        self.used_mirror = msg.get("UsedMirror").to_string();
        if self.queue_counter <= 1 {
            if cnf.local_only && is_transient(msg) {
                self.status = ItemStatus::Idle;
                out.dequeue();
                return;
            }
            self.status = ItemStatus::Error;
            out.dequeue();
        }

        let code = match msg.lookup("FailReason") {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ => self.error_text.clone(),
        };
        self.report_mirror_failure(&code, out);
    }

    /// Rename `from` to `to`, turning a failure into an item error.
    pub(crate) fn rename(&mut self, from: &Path, to: &Path) -> bool {
        match fs::rename(from, to) {
            Ok(()) => true,
            Err(e) => {
                self.fail_hard(format!(
                    "rename failed, {} ({} -> {}).",
                    e,
                    from.display(),
                    to.display()
                ));
                false
            }
        }
    }

    /// Move a rejected file aside as `.FAILED` and record why.
    pub(crate) fn rename_on_error(&mut self, error: VerifyError, out: &mut Outcome) {
        if self.dest_file.exists() {
            let dest = self.dest_file.clone();
            self.rename(&dest, &with_suffix(&dest, ".FAILED"));
        }
        match error {
            VerifyError::HashSumMismatch => {
                self.error_text = "Hash Sum mismatch".to_string();
                self.status = ItemStatus::AuthError;
                self.report_mirror_failure("HashChecksumFailure", out);
            }
            VerifyError::SizeMismatch => {
                self.error_text = "Size mismatch".to_string();
                self.status = ItemStatus::AuthError;
                self.report_mirror_failure("SizeFailure", out);
            }
            VerifyError::InvalidFormat => {
                // a captive portal or proxy, not the mirror
                self.error_text = "Invalid file format".to_string();
                self.status = ItemStatus::Error;
            }
        }
    }

    pub(crate) fn report_mirror_failure(&self, code: &str, out: &mut Outcome) {
        if self.used_mirror.is_empty() {
            return;
        }
        out.actions.push(Action::ReportMirrorFailure {
            used_mirror: self.used_mirror.clone(),
            uri: self.desc.uri.clone(),
            code: code.to_string(),
        });
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn is_transient(msg: &Message) -> bool {
    msg.lookup_bool("Transient-Failure", false)
}

/// Failure reasons that say nothing about the file or the mirror.
pub(crate) fn is_network_failure(msg: &Message) -> bool {
    matches!(
        msg.get("FailReason"),
        "Timeout" | "TmpResolveFailure" | "ResolveFailure" | "ConnectionRefused"
    )
}

/// Final location of `uri` under the lists directory.
pub(crate) fn lists_file(config: &AcquireConfig, uri: &str) -> PathBuf {
    config.lists_dir.join(uri_to_file_name(uri))
}

/// Download location of `uri` under `lists/partial/`.
pub(crate) fn lists_partial_file(config: &AcquireConfig, uri: &str) -> PathBuf {
    config.lists_partial_dir().join(uri_to_file_name(uri))
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `Last-Modified` header value from a file's mtime.
pub(crate) fn last_modified(path: &Path) -> Option<String> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(time_rfc1123(modified))
}

pub(crate) fn header(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

/// Index files are world readable once in place.
pub(crate) fn make_readable(path: &Path) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
        debug!(path = %path.display(), error = %e, "chmod failed");
    }
}

pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "unlink failed"),
    }
}

/// Shared sibling list of a merged patch set.
pub type Siblings = Arc<[ItemId]>;
