//! Incremental index updates: the diff index and both patch strategies.
//!
//! ```text
//!   DiffIndex ──UpToDate──► IndexDiffs (no patches, bookkeeping only)
//!       │ ──Patches──────► IndexDiffs  FetchDiff ⇄ ApplyDiff, one patch at a time
//!       │                  MergeDiffs  one item per patch, last fetch applies all
//!       └──Fallback──────► Index (full download)
//! ```
//!
//! The index under `lists/` is only ever replaced by rename, so readers see
//! either the old or the new complete file.

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::AcquireConfig;
use crate::hashes::{sha1_file, HashString};
use crate::message::Message;
use crate::pdiff::{DiffIndex, DiffInfo, PatchLimits, PatchPlan};

use super::{
    header, last_modified, lists_file, lists_partial_file, make_readable, remove_quietly,
    with_suffix, DiffChainSpec, DoneInfo, HandlerContext, IndexSpec, Item, ItemCore, ItemDesc,
    ItemId, ItemKind, ItemSpec, ItemStatus, Outcome, Siblings, VerifyError,
};

/// Full-download fallback for an index whose patches could not be used.
fn fallback_index(real_uri: &str, description: &str, short_desc: &str, expected: &HashString) -> ItemSpec {
    ItemSpec::Index(IndexSpec::new(
        ItemDesc::new(real_uri, description, short_desc),
        expected.clone(),
    ))
}

fn patch_uri(real_uri: &str, patch: &DiffInfo) -> String {
    format!("{}.diff/{}.gz", real_uri, patch.file)
}

fn patch_partial_file(config: &AcquireConfig, real_uri: &str, patch: &DiffInfo) -> PathBuf {
    lists_partial_file(config, &format!("{}.diff/{}", real_uri, patch.file))
}

/// `<final>.ed.<patch>.gz`, where merged patches wait for the combined apply.
fn merge_patch_file(final_file: &std::path::Path, patch: &DiffInfo) -> PathBuf {
    with_suffix(final_file, &format!(".ed.{}.gz", patch.file))
}

fn verifies(expected: &HashString, path: &std::path::Path) -> bool {
    expected.is_empty() || expected.verify_file(path).unwrap_or(false)
}

// =============================================================================
// Diff index
// =============================================================================

/// State of a diff index item.
#[derive(Debug, Clone)]
pub struct DiffIndexState {
    pub real_uri: String,
    pub expected: HashString,
    /// Description of the index itself, for successors.
    pub description: String,
}

pub(super) fn create_diff_index(
    id: ItemId,
    desc: ItemDesc,
    expected: HashString,
    ctx: &HandlerContext<'_>,
) -> (Item, Outcome) {
    let config = ctx.config;
    let real_uri = desc.uri.clone();
    let item_desc = ItemDesc::new(
        format!("{}.diff/Index", real_uri),
        format!("{}/DiffIndex", desc.description),
        &desc.short_desc,
    );
    let dest = with_suffix(&lists_partial_file(config, &real_uri), ".DiffIndex");
    let mut core = ItemCore::new(id, item_desc, dest);
    let mut state = DiffIndexState {
        real_uri,
        expected,
        description: desc.description,
    };

    let mut out = Outcome::new();
    let current = lists_file(config, &state.real_uri);
    if !current.exists() || core.desc.uri.starts_with("file:/") {
        debug!(uri = %state.real_uri, "no local index to patch");
        state.failed(&mut core, &mut out);
    } else {
        core.queue(&mut out);
    }

    (
        Item {
            core,
            kind: ItemKind::DiffIndex(state),
        },
        out,
    )
}

impl DiffIndexState {
    pub(super) fn custom_headers(&self, config: &AcquireConfig) -> Vec<(String, String)> {
        let mut headers = vec![header("Index-File", "true")];
        let final_file = with_suffix(&lists_file(config, &self.real_uri), ".IndexDiff");
        if let Some(time) = last_modified(&final_file) {
            headers.push(header("Last-Modified", time));
        }
        headers
    }

    pub(super) fn failed(&mut self, core: &mut ItemCore, out: &mut Outcome) {
        debug!(uri = %core.desc.uri, "falling back to full index download");
        out.spawn(fallback_index(
            &self.real_uri,
            &self.description,
            &core.desc.short_desc,
            &self.expected,
        ));
        core.finish_incomplete(out);
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

        let final_file = with_suffix(&lists_file(config, &self.real_uri), ".IndexDiff");
        let downloaded = core.dest_file.clone();
        if !core.rename(&downloaded, &final_file) {
            return;
        }
        make_readable(&final_file);
        core.dest_file = final_file;

        if !self.plan(core, ctx, out) {
            self.failed(core, out);
            return;
        }

        core.complete = true;
        core.status = ItemStatus::Done;
        out.dequeue();
    }

    /// Spawn the patch chain; `false` when a full download is needed.
    fn plan(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) -> bool {
        let config = ctx.config;
        let index = match DiffIndex::load(&core.dest_file) {
            Ok(index) => index,
            Err(e) => {
                debug!(path = %core.dest_file.display(), error = %e, "unusable diff index");
                return false;
            }
        };
        let local_sha1 = match sha1_file(&lists_file(config, &self.real_uri)) {
            Ok(sha1) => sha1,
            Err(e) => {
                debug!(error = %e, "cannot hash local index");
                return false;
            }
        };

        let limits = PatchLimits {
            file_limit: config.pdiffs_file_limit,
            size_limit_percent: config.pdiffs_size_limit,
        };
        let chain = |description: String, patches: Vec<DiffInfo>| DiffChainSpec {
            desc: ItemDesc::new(&self.real_uri, description, &core.desc.short_desc),
            expected: self.expected.clone(),
            server_sha1: index.server_sha1.clone(),
            patches,
        };

        match index.plan(&local_sha1, limits) {
            PatchPlan::UpToDate => {
                debug!(uri = %self.real_uri, "index is up to date");
                out.spawn(ItemSpec::IndexDiffs(chain(self.description.clone(), Vec::new())));
            }
            PatchPlan::Patches(patches) => {
                let mut description = self.description.clone();
                if let Some(space) = description.rfind(' ') {
                    description.truncate(space);
                }
                let merge = config.pdiffs_merge && !index.server_merged();
                debug!(uri = %self.real_uri, patches = patches.len(), merge, "patching index");
                let spec = chain(description, patches);
                out.spawn(if merge {
                    ItemSpec::MergeDiffs(spec)
                } else {
                    ItemSpec::IndexDiffs(spec)
                });
            }
            PatchPlan::Fallback(reason) => {
                info!(uri = %self.real_uri, ?reason, "not using patches");
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Sequential patches
// =============================================================================

/// Phase of a patch transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    FetchDiff,
    ApplyDiff,
}

/// State of a sequential patch chain.
#[derive(Debug, Clone)]
pub struct IndexDiffsState {
    pub real_uri: String,
    pub expected: HashString,
    pub server_sha1: String,
    pub patches: VecDeque<DiffInfo>,
    pub state: PatchState,
    pub description: String,
}

pub(super) fn create_index_diffs(id: ItemId, chain: DiffChainSpec, ctx: &HandlerContext<'_>) -> (Item, Outcome) {
    let dest = lists_partial_file(ctx.config, &chain.desc.uri);
    let mut state = IndexDiffsState {
        real_uri: chain.desc.uri.clone(),
        expected: chain.expected,
        server_sha1: chain.server_sha1,
        patches: chain.patches.into(),
        state: PatchState::FetchDiff,
        description: chain.desc.description.clone(),
    };
    let mut core = ItemCore::new(id, chain.desc, dest);
    let mut out = Outcome::new();

    if state.patches.is_empty() {
        state.up_to_date(&mut core, ctx, &mut out);
    } else {
        state.queue_next_diff(&mut core, ctx, &mut out);
    }

    (
        Item {
            core,
            kind: ItemKind::IndexDiffs(state),
        },
        out,
    )
}

impl IndexDiffsState {
    /// Nothing to patch: claim the current index so that cleaning keeps it.
    fn up_to_date(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) {
        core.dest_file = lists_file(ctx.config, &self.real_uri);
        if !verifies(&self.expected, &core.dest_file) {
            core.rename_on_error(VerifyError::HashSumMismatch, out);
            out.dequeue();
            return;
        }
        core.finish_incomplete(out);
    }

    /// The whole chain applied; the final file must match.
    fn finish(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) {
        core.dest_file = lists_file(ctx.config, &self.real_uri);
        if !verifies(&self.expected, &core.dest_file) {
            core.rename_on_error(VerifyError::HashSumMismatch, out);
            out.dequeue();
            return;
        }
        debug!(path = %core.dest_file.display(), "patch chain complete");
        core.complete = true;
        core.status = ItemStatus::Done;
        out.dequeue();
    }

    fn queue_next_diff(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) {
        let final_file = lists_file(ctx.config, &self.real_uri);
        let local_sha1 = sha1_file(&final_file).unwrap_or_default();

        if local_sha1 == self.server_sha1 {
            self.finish(core, ctx, out);
            return;
        }

        // skip patches that do not start from the local file
        while self.patches.front().is_some_and(|p| p.sha1 != local_sha1) {
            self.patches.pop_front();
        }
        let Some(patch) = self.patches.front() else {
            self.failed(core, out);
            return;
        };

        core.desc.uri = patch_uri(&self.real_uri, patch);
        core.desc.description = format!("{} {}.pdiff", self.description, patch.file);
        core.dest_file = patch_partial_file(ctx.config, &self.real_uri, patch);
        debug!(uri = %core.desc.uri, "queueing patch");
        core.queue(out);
    }

    pub(super) fn failed(&mut self, core: &mut ItemCore, out: &mut Outcome) {
        debug!(uri = %core.desc.uri, "falling back to full index download");
        out.spawn(fallback_index(
            &self.real_uri,
            &self.description,
            &core.desc.short_desc,
            &self.expected,
        ));
        core.finish_incomplete(out);
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
        let final_file = lists_file(ctx.config, &self.real_uri);
        let ed_file = with_suffix(&final_file, ".ed");

        match self.state {
            PatchState::FetchDiff => {
                let downloaded = core.dest_file.clone();
                if !core.rename(&downloaded, &ed_file) {
                    return;
                }
                self.state = PatchState::ApplyDiff;
                core.local = true;
                core.desc.uri = format!("rred:{}", final_file.display());
                core.mode = Some("rred".to_string());
                core.queue(out);
            }
            PatchState::ApplyDiff => {
                self.patches.pop_front();
                remove_quietly(&ed_file);

                let patched = core.dest_file.clone();
                if !core.rename(&patched, &final_file) {
                    return;
                }
                make_readable(&final_file);

                if self.patches.is_empty() {
                    self.finish(core, ctx, out);
                } else {
                    self.state = PatchState::FetchDiff;
                    core.local = false;
                    core.mode = None;
                    self.queue_next_diff(core, ctx, out);
                }
            }
        }
    }
}

// =============================================================================
// Merged patches
// =============================================================================

/// Phase of one merged patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    FetchDiff,
    /// Fetched and waiting, or given up after a failure.
    DoneDiff,
    ApplyDiff,
    /// The sibling that triggered the full-download fallback.
    ErrorDiff,
}

/// State of one patch in a merged set.
#[derive(Debug, Clone)]
pub struct MergeDiffsState {
    pub real_uri: String,
    pub expected: HashString,
    pub patch: DiffInfo,
    /// Every item of the set, this one included.
    pub siblings: Siblings,
    pub state: MergeState,
    pub description: String,
}

pub(super) fn create_merge_diffs(
    first: ItemId,
    chain: DiffChainSpec,
    ctx: &HandlerContext<'_>,
) -> Vec<(Item, Outcome)> {
    let siblings: Siblings = (0..chain.patches.len())
        .map(|i| ItemId(first.0 + i))
        .collect();

    chain
        .patches
        .iter()
        .enumerate()
        .map(|(i, patch)| {
            let desc = ItemDesc::new(
                patch_uri(&chain.desc.uri, patch),
                format!("{} {}.pdiff", chain.desc.description, patch.file),
                &chain.desc.short_desc,
            );
            let dest = patch_partial_file(ctx.config, &chain.desc.uri, patch);
            let core = ItemCore::new(siblings[i], desc, dest);
            let state = MergeDiffsState {
                real_uri: chain.desc.uri.clone(),
                expected: chain.expected.clone(),
                patch: patch.clone(),
                siblings: siblings.clone(),
                state: MergeState::FetchDiff,
                description: chain.desc.description.clone(),
            };
            let mut out = Outcome::new();
            core.queue(&mut out);
            (
                Item {
                    core,
                    kind: ItemKind::MergeDiffs(state),
                },
                out,
            )
        })
        .collect()
}

impl MergeDiffsState {
    /// The other members of the set, as found in the arena.
    fn others<'a>(&self, me: ItemId, ctx: &HandlerContext<'a>) -> Vec<&'a MergeDiffsState> {
        let arena = ctx.arena;
        self.siblings
            .iter()
            .filter(|id| **id != me)
            .filter_map(|id| match arena.get(*id).map(|i| &i.kind) {
                Some(ItemKind::MergeDiffs(s)) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub(super) fn failed(&mut self, core: &mut ItemCore, ctx: &HandlerContext<'_>, out: &mut Outcome) {
        core.finish_incomplete(out);

        // only the first failure falls back
        self.state = MergeState::DoneDiff;
        if self.others(core.id, ctx).iter().any(|s| s.state == MergeState::ErrorDiff) {
            return;
        }
        self.state = MergeState::ErrorDiff;
        info!(uri = %self.real_uri, "falling back to full index download");
        out.spawn(fallback_index(
            &self.real_uri,
            &self.description,
            &core.desc.short_desc,
            &self.expected,
        ));
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
        let final_file = lists_file(ctx.config, &self.real_uri);

        match self.state {
            MergeState::FetchDiff => {
                let downloaded = core.dest_file.clone();
                if !core.rename(&downloaded, &merge_patch_file(&final_file, &self.patch)) {
                    return;
                }

                self.state = MergeState::DoneDiff;
                if self.others(core.id, ctx).iter().any(|s| s.state != MergeState::DoneDiff) {
                    debug!(uri = %core.desc.uri, "not the last patch of the set");
                    return;
                }

                self.state = MergeState::ApplyDiff;
                core.local = true;
                core.desc.uri = format!("rred:{}", final_file.display());
                core.mode = Some("rred".to_string());
                core.queue(out);
            }
            MergeState::ApplyDiff => {
                if !verifies(&self.expected, &core.dest_file) {
                    core.rename_on_error(VerifyError::HashSumMismatch, out);
                    return;
                }

                let patched = core.dest_file.clone();
                if !core.rename(&patched, &final_file) {
                    return;
                }
                make_readable(&final_file);
                core.dest_file = final_file.clone();

                remove_quietly(&merge_patch_file(&final_file, &self.patch));
                for other in self.others(core.id, ctx) {
                    remove_quietly(&merge_patch_file(&final_file, &other.patch));
                }
                core.complete = true;
            }
            MergeState::DoneDiff | MergeState::ErrorDiff => {}
        }
    }
}
