//! The metadata trust chain: signatures, release files and the indexes
//! they describe.
//!
//! ```text
//!   InRelease ──ok──► gpgv:InRelease ──ok──► indexes (verified)
//!       │ fail                │ fail
//!       ▼                     ▼
//!   Release.gpg ──► Release ──► gpgv:Release.gpg ──► indexes
//!       │ fail          (no signature)
//!       └───────────────► Release ──► indexes (hash sums only)
//! ```
//!
//! A previously trusted signature is never thrown away before a new one
//! has been verified: it waits as a `.reverify` shadow in `partial/` and is
//! put back when the fetch or the verification fails for reasons that say
//! nothing about the repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::acquire::MethodConfig;
use crate::config::{AcquireConfig, UNCOMPRESSED};
use crate::hashes::HashString;
use crate::message::Message;
use crate::release::ReleaseFile;
use crate::sources::{IndexTarget, ReleaseSource};
use crate::uri::time_to_str;

use super::{
    header, is_transient, last_modified, lists_file, lists_partial_file, make_readable,
    remove_quietly, with_suffix, Action, DoneInfo, HandlerContext, Item, ItemCore, ItemDesc,
    ItemId, ItemKind, ItemSpec, ItemStatus, Outcome,
};

/// The release file of one distribution, its detached signature, and the
/// indexes to queue once it is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseChain {
    pub release: ItemDesc,
    pub signature: ItemDesc,
    pub dist: String,
    pub targets: Arc<[IndexTarget]>,
}

impl ReleaseChain {
    pub fn new(source: &ReleaseSource) -> Self {
        Self {
            release: source.release.clone(),
            signature: source.signature.clone(),
            dist: source.dist.clone(),
            targets: source.targets.clone().into(),
        }
    }
}

/// Move a trusted final file out of the way, returning the shadow path.
fn shelve(core: &mut ItemCore, final_file: &Path, shadow: PathBuf) -> Option<PathBuf> {
    if !final_file.is_file() {
        return None;
    }
    core.rename(final_file, &shadow).then_some(shadow)
}

/// Put a shadow back unless the run already produced a new final file.
///
/// Called after the engine drained its queues, so the queue count says
/// nothing here; an item that never started or failed is still idle,
/// sizeless and without error text.
fn restore_unattempted(core: &ItemCore, final_file: &Path, shadow: &Path) {
    let untouched = core.status == ItemStatus::Idle
        && core.file_size == 0
        && !core.complete
        && core.error_text.is_empty();
    if untouched && !final_file.exists() && shadow.exists() {
        debug!(shadow = %shadow.display(), "restoring unused signature");
        if let Err(e) = std::fs::rename(shadow, final_file) {
            debug!(error = %e, "restore failed");
        }
    }
}

// =============================================================================
// Detached signature
// =============================================================================

/// State of a detached signature item.
#[derive(Debug, Clone)]
pub struct MetaSigState {
    pub real_uri: String,
    pub chain: ReleaseChain,
    /// The previous signature, moved aside until the new one is verified.
    pub last_good: Option<PathBuf>,
}

pub(super) fn create_meta_sig(
    id: ItemId,
    signature: ItemDesc,
    chain: ReleaseChain,
    ctx: &HandlerContext<'_>,
) -> (Item, Outcome) {
    let config = ctx.config;
    let real_uri = signature.uri.clone();
    let dest = lists_partial_file(config, &real_uri);
    remove_quietly(&dest);

    let mut core = ItemCore::new(id, signature, dest);
    let final_file = lists_file(config, &real_uri);
    let shadow = with_suffix(&core.dest_file, ".reverify");
    let last_good = shelve(&mut core, &final_file, shadow);

    let mut out = Outcome::new();
    core.queue(&mut out);
    (
        Item {
            core,
            kind: ItemKind::MetaSig(MetaSigState {
                real_uri,
                chain,
                last_good,
            }),
        },
        out,
    )
}

impl MetaSigState {
    pub(super) fn custom_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![header("Index-File", "true")];
        if let Some(time) = self.last_good.as_deref().and_then(last_modified) {
            headers.push(header("Last-Modified", time));
        }
        headers
    }

    pub(super) fn done(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        info: &DoneInfo,
        _ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        core.base_done(msg, info.size, out);

        let filename = msg.get("Filename");
        if filename.is_empty() {
            core.fail_hard("Method gave a blank filename");
            return;
        }
        if Path::new(filename) != core.dest_file {
            core.local = true;
            core.desc.uri = format!("copy:{}", filename);
            core.queue(out);
            return;
        }

        core.complete = true;

        // not modified: verify the release against the old signature
        if msg.lookup_bool("IMS-Hit", false) {
            if let Some(last_good) = &self.last_good {
                let dest = core.dest_file.clone();
                core.rename(last_good, &dest);
            }
        }

        out.spawn(ItemSpec::MetaIndex {
            chain: self.chain.clone(),
            sig_file: Some(core.dest_file.clone()),
        });
    }

    pub(super) fn failed(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        cnf: &MethodConfig,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        let final_file = lists_file(ctx.config, &self.real_uri);

        if core.status == ItemStatus::TransientNetworkError {
            core.base_failed(msg, cnf, out);
            if let Some(last_good) = self.last_good.as_ref().filter(|p| p.exists()) {
                info!(uri = %self.real_uri, "keeping previous signature after network failure");
                if let Err(e) = std::fs::rename(last_good, &final_file) {
                    debug!(error = %e, "restore failed");
                }
            }
            core.status = ItemStatus::TransientNetworkError;
            return;
        }

        // without a signature the old one must not vouch for new content
        remove_quietly(&final_file);
        out.spawn(ItemSpec::MetaIndex {
            chain: self.chain.clone(),
            sig_file: None,
        });

        if cnf.local_only || !is_transient(msg) {
            debug!(uri = %self.real_uri, "no signature, continuing unsigned");
            core.finish_incomplete(out);
            return;
        }
        core.base_failed(msg, cnf, out);
    }

    pub(super) fn retire(&mut self, core: &mut ItemCore, config: &AcquireConfig) {
        if let Some(last_good) = &self.last_good {
            restore_unattempted(core, &lists_file(config, &self.real_uri), last_good);
        }
    }
}

// =============================================================================
// Release file
// =============================================================================

/// State of a release file item, plain or clear-signed.
#[derive(Debug, Clone)]
pub struct MetaIndexState {
    pub real_uri: String,
    pub chain: ReleaseChain,
    /// Signature to check against. Equal to the destination when clear-signed.
    pub sig_file: Option<PathBuf>,
    /// The current transfer is the verification pass.
    pub auth_pass: bool,
    pub ims_hit: bool,
    clearsig: bool,
    release: ReleaseFile,
}

pub(super) fn create_meta_index(
    id: ItemId,
    chain: ReleaseChain,
    sig_file: Option<PathBuf>,
    ctx: &HandlerContext<'_>,
) -> (Item, Outcome) {
    let desc = chain.release.clone();
    let state = MetaIndexState {
        real_uri: desc.uri.clone(),
        release: ReleaseFile::new(&chain.dist),
        chain,
        sig_file,
        auth_pass: false,
        ims_hit: false,
        clearsig: false,
    };
    let dest = lists_partial_file(ctx.config, &state.real_uri);
    let core = ItemCore::new(id, desc, dest);
    let mut out = Outcome::new();
    core.queue(&mut out);
    (
        Item {
            core,
            kind: ItemKind::MetaIndex(state),
        },
        out,
    )
}

pub(super) fn create_meta_clearsig(
    id: ItemId,
    inrelease: ItemDesc,
    chain: ReleaseChain,
    ctx: &HandlerContext<'_>,
) -> (Item, Outcome) {
    let config = ctx.config;
    let real_uri = inrelease.uri.clone();
    let dest = lists_partial_file(config, &real_uri);
    let mut core = ItemCore::new(id, inrelease, dest.clone());

    let final_file = lists_file(config, &real_uri);
    shelve(&mut core, &final_file, with_suffix(&dest, ".reverify"));

    let state = MetaIndexState {
        real_uri,
        release: ReleaseFile::new(&chain.dist),
        chain,
        sig_file: Some(dest),
        auth_pass: false,
        ims_hit: false,
        clearsig: true,
    };
    let mut out = Outcome::new();
    core.queue(&mut out);
    (
        Item {
            core,
            kind: ItemKind::MetaIndex(state),
        },
        out,
    )
}

impl MetaIndexState {
    /// Whether this is the inline-signed variant.
    pub fn is_clearsigned(&self) -> bool {
        self.clearsig
    }

    /// The parsed release, empty until loaded.
    pub fn release(&self) -> &ReleaseFile {
        &self.release
    }

    fn signature_is_dest(&self, core: &ItemCore) -> bool {
        self.sig_file.as_deref() == Some(core.dest_file.as_path())
    }

    pub(super) fn custom_headers(&self, core: &ItemCore, config: &AcquireConfig) -> Vec<(String, String)> {
        let final_file = lists_file(config, &self.real_uri);
        let mut headers = vec![header("Index-File", "true")];
        let time = if self.clearsig {
            headers.push(header("Fail-Ignore", "true"));
            last_modified(&final_file)
                .or_else(|| last_modified(&with_suffix(&core.dest_file, ".reverify")))
        } else {
            last_modified(&final_file)
        };
        if let Some(time) = time {
            headers.push(header("Last-Modified", time));
        }
        headers
    }

    pub(super) fn retire(&mut self, core: &mut ItemCore, config: &AcquireConfig) {
        if self.clearsig {
            let shadow = with_suffix(&lists_partial_file(config, &self.real_uri), ".reverify");
            restore_unattempted(core, &lists_file(config, &self.real_uri), &shadow);
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
        let config = ctx.config;

        if self.auth_pass {
            self.auth_done(core, msg, ctx, out);
            core.complete = true;
        } else {
            self.retrieval_done(core, msg, config, out);
            if !core.complete {
                return;
            }

            match &self.sig_file {
                None => {
                    if let Err(e) = self.release.load(&core.dest_file) {
                        debug!(error = %e, "unsigned release not parsable");
                    }
                    self.queue_indexes(core, false, config, out);
                }
                Some(sig) => {
                    debug!(sig = %sig.display(), release = %core.dest_file.display(), "queueing signature verification");
                    self.auth_pass = true;
                    core.local = true;
                    core.desc.uri = format!("gpgv:{}", sig.display());
                    core.mode = Some("gpgv".to_string());
                    core.queue(out);
                    return;
                }
            }
        }

        if core.complete {
            let final_file = lists_file(config, &self.real_uri);
            if self.signature_is_dest(core) {
                self.sig_file = Some(final_file.clone());
            }
            let dest = core.dest_file.clone();
            if dest != final_file {
                core.rename(&dest, &final_file);
            }
            make_readable(&final_file);
            core.dest_file = final_file;
        }
    }

    fn retrieval_done(&mut self, core: &mut ItemCore, msg: &Message, config: &AcquireConfig, out: &mut Outcome) {
        let filename = msg.get("Filename");
        if filename.is_empty() {
            core.fail_hard("Method gave a blank filename");
            return;
        }
        if Path::new(filename) != core.dest_file {
            core.local = true;
            core.desc.uri = format!("copy:{}", filename);
            core.queue(out);
            return;
        }

        // verify the file we already have
        self.ims_hit = msg.lookup_bool("IMS-Hit", false);
        if self.ims_hit {
            let final_file = lists_file(config, &self.real_uri);
            if self.signature_is_dest(core) {
                self.sig_file = Some(final_file.clone());
                let shadow = with_suffix(&core.dest_file, ".reverify");
                if shadow.is_file() {
                    core.rename(&shadow, &final_file);
                }
            }
            core.dest_file = final_file;
        }
        core.complete = true;
    }

    fn auth_done(&mut self, core: &mut ItemCore, msg: &Message, ctx: &HandlerContext<'_>, out: &mut Outcome) {
        let config = ctx.config;
        if let Err(e) = self.release.load(&core.dest_file) {
            core.status = ItemStatus::AuthError;
            core.error_text = e.to_string();
            return;
        }
        if !self.verify_vendor(core, msg, config, out) {
            return;
        }
        info!(release = %core.dest_file.display(), "signature verified");

        self.queue_indexes(core, true, config, out);

        if self.signature_is_dest(core) {
            return;
        }
        if let Some(sig) = self.sig_file.clone() {
            let verified = with_suffix(&lists_file(config, &self.real_uri), ".gpg");
            core.rename(&sig, &verified);
            make_readable(&verified);
        }
    }

    /// Post-signature checks on the release contents.
    fn verify_vendor(&self, core: &mut ItemCore, msg: &Message, config: &AcquireConfig, out: &mut Outcome) -> bool {
        let text = msg.encode();
        if let Some(pos) = text.find("NO_PUBKEY ") {
            let rest = &text[pos + "NO_PUBKEY ".len()..];
            let keys = rest.split('\n').next().unwrap_or("");
            out.warn(format!(
                "There is no public key available for the following key IDs:\n{}",
                keys
            ));
        }

        let mut expected = self.release.expected_dist();
        if expected == "../project/experimental" {
            expected = "experimental";
        }
        if let Some(pos) = expected.rfind('/') {
            expected = &expected[..pos];
        }
        if expected == "." {
            expected = "";
        }

        let valid_until = self.release.valid_until();
        if config.check_valid_until && valid_until > 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let invalid_since = now - valid_until;
            if invalid_since > 0 {
                core.fail_hard(format!(
                    "Release file for {} is expired (invalid since {}). Updates for this repository will not be applied.",
                    self.real_uri,
                    time_to_str(invalid_since as u64)
                ));
                return false;
            }
        }

        if !self.release.check_dist(expected) && !expected.is_empty() {
            out.warn(format!(
                "Conflicting distribution: {} (expected {} but got {})",
                core.desc.description,
                expected,
                self.release.dist()
            ));
        }
        true
    }

    /// Spawn an item for every target of the release.
    fn queue_indexes(&self, core: &mut ItemCore, verify: bool, config: &AcquireConfig, out: &mut Outcome) {
        let release = &self.release;
        let translations_listed = release.meta_keys().any(|k| k.contains("Translation-"));

        for target in self.chain.targets.iter() {
            let record = release.lookup(&target.meta_key);
            let mut compressed_available = false;
            let expected = match record {
                Some(record) => {
                    if verify && record.hash.is_empty() && !target.optional {
                        core.status = ItemStatus::AuthError;
                        core.error_text = format!(
                            "Unable to find hash sum for '{}' in Release file",
                            target.meta_key
                        );
                        return;
                    }
                    record.hash.clone()
                }
                None if target.optional => {
                    compressed_available = config
                        .compression_types()
                        .iter()
                        .any(|t| release.exists(&format!("{}.{}", target.meta_key, t)));
                    HashString::default()
                }
                None if verify => {
                    core.status = ItemStatus::AuthError;
                    core.error_text = format!(
                        "Unable to find expected entry '{}' in Release file (Wrong sources.list entry or malformed file)",
                        target.meta_key
                    );
                    return;
                }
                None => HashString::default(),
            };

            let desc = ItemDesc::new(&target.uri, &target.description, &target.short_desc);
            let diff_listed = release.exists(&format!("{}.diff/Index", target.meta_key));

            if target.optional {
                if target.sub_index {
                    out.spawn(ItemSpec::SubIndex { desc, expected });
                } else if !translations_listed || record.is_some() || compressed_available {
                    if config.pdiffs && translations_listed && diff_listed {
                        out.spawn(ItemSpec::DiffIndex { desc, expected });
                    } else {
                        let compression = self.compression_for(target, &expected, config);
                        out.spawn(ItemSpec::index_for_target(target, expected, compression));
                    }
                }
                continue;
            }

            if config.pdiffs && (!verify || diff_listed) {
                out.spawn(ItemSpec::DiffIndex { desc, expected });
            } else {
                let compression = self.compression_for(target, &expected, config);
                out.spawn(ItemSpec::index_for_target(target, expected, compression));
            }
        }
    }

    /// Compression variants worth trying: the ones the release lists.
    fn compression_for(&self, target: &IndexTarget, expected: &HashString, config: &AcquireConfig) -> Vec<String> {
        let types = config.compression_types();
        if expected.is_empty() {
            return types;
        }
        let listed: Vec<String> = types
            .into_iter()
            .filter(|t| t == UNCOMPRESSED || self.release.exists(&format!("{}.{}", target.meta_key, t)))
            .collect();
        if listed.is_empty() {
            vec![UNCOMPRESSED.to_string()]
        } else {
            listed
        }
    }

    pub(super) fn failed(
        &mut self,
        core: &mut ItemCore,
        msg: &Message,
        cnf: &MethodConfig,
        ctx: &HandlerContext<'_>,
        out: &mut Outcome,
    ) {
        let config = ctx.config;

        if self.clearsig && !self.auth_pass {
            // a stale InRelease would look authenticated next time
            remove_quietly(&lists_file(config, &self.real_uri));
            out.spawn(ItemSpec::MetaSig {
                signature: self.chain.signature.clone(),
                chain: self.chain.clone(),
            });
            if cnf.local_only || !is_transient(msg) {
                core.finish_incomplete(out);
            }
            return;
        }

        if self.auth_pass {
            let gpg_suffix = if self.clearsig { "" } else { ".gpg" };
            let last_good = with_suffix(
                &lists_partial_file(config, &self.real_uri),
                &format!("{}.reverify", gpg_suffix),
            );
            let reason = msg.get("Message");

            if last_good.exists() {
                let verified = with_suffix(&lists_file(config, &self.real_uri), gpg_suffix);
                core.rename(&last_good, &verified);
                core.status = ItemStatus::TransientNetworkError;
                out.warn(format!(
                    "An error occurred during the signature verification. The repository is not updated and the previous index files will be used. GPG error: {}: {}",
                    core.desc.description, reason
                ));
                out.actions.push(Action::RunAuthFailureHooks);
                return;
            }
            if reason.contains("NODATA") {
                core.status = ItemStatus::AuthError;
                core.error_text = format!("GPG error: {}: {}", core.desc.description, reason);
                out.dequeue();
                return;
            }
            out.warn(format!("GPG error: {}: {}", core.desc.description, reason));
            core.report_mirror_failure("GPGFailure", out);
        }

        // keep the content so the indexes can still be matched against it
        if core.dest_file.exists() {
            let mut final_file = lists_file(config, &self.real_uri);
            if self.signature_is_dest(core) {
                if let Some(pos) = self.real_uri.rfind("InRelease") {
                    self.real_uri.replace_range(pos..pos + "InRelease".len(), "Release");
                }
                final_file = lists_file(config, &self.real_uri);
                self.sig_file = Some(final_file.clone());
            }
            let dest = core.dest_file.clone();
            core.rename(&dest, &final_file);
            make_readable(&final_file);
            core.dest_file = final_file;
        }

        self.queue_indexes(core, false, config, out);
    }
}
