//! Incremental index updates.
//!
//! A repository may publish, next to each index, a small diff index listing
//! the hash of the current index, the hashes of earlier versions and the
//! ed-style patches leading from each of them to the next. [`DiffIndex::plan`]
//! decides which patches a local copy needs; [`apply_ed_patches`] replays them.

mod index;
mod rred;

pub use index::{DiffIndex, DiffIndexError, DiffInfo, FallbackReason, PatchLimits, PatchPlan};
pub use rred::{apply_ed_patches, apply_ed_script, PatchError};
