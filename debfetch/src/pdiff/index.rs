//! Diff index parsing and patch planning.

use std::path::Path;

use thiserror::Error;

use crate::tagfile::{self, TagFileError};

/// Errors from reading a diff index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiffIndexError {
    #[error("failed to read diff index: {0}")]
    Read(String),

    #[error(transparent)]
    TagFile(#[from] TagFileError),

    #[error("diff index has no sections")]
    Empty,
}

/// One step of a patch chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffInfo {
    /// SHA1 of the index this patch applies to.
    pub sha1: String,
    /// Size of that index version.
    pub size: u64,
    /// Patch name, without the `.gz` suffix.
    pub file: String,
}

/// Escape hatches that make a full download preferable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLimits {
    /// Maximum number of patches; 0 disables the check.
    pub file_limit: usize,
    /// Patch volume allowed, as a percentage of the full index size.
    pub size_limit_percent: u64,
}

impl Default for PatchLimits {
    fn default() -> Self {
        Self {
            file_limit: 0,
            size_limit_percent: 100,
        }
    }
}

/// Why patching was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The local index is not in the history.
    NoMatch,
    TooManyPatches { needed: usize, limit: usize },
    TooLarge { size: u64, limit: u64 },
}

/// What to do with a local index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchPlan {
    UpToDate,
    Patches(Vec<DiffInfo>),
    Fallback(FallbackReason),
}

/// Parsed `Index` file of a `.diff/` directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffIndex {
    pub server_sha1: String,
    pub server_size: u64,
    pub history: Vec<DiffInfo>,
    /// `SHA1-Patches` entries: patch hash, patch size, patch name.
    pub patches: Vec<DiffInfo>,
    pub precedence: Option<String>,
}

impl DiffIndex {
    pub fn parse(text: &str) -> Result<Self, DiffIndexError> {
        let section = tagfile::parse_sections(text)?
            .into_iter()
            .next()
            .ok_or(DiffIndexError::Empty)?;

        let mut current = section.get("SHA1-Current").unwrap_or("").split_whitespace();
        let server_sha1 = current.next().unwrap_or("").to_string();
        let server_size = current.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(Self {
            server_sha1,
            server_size,
            history: parse_triples(&section.lines("SHA1-History")),
            patches: parse_triples(&section.lines("SHA1-Patches")),
            precedence: section.get("X-Patch-Precedence").map(str::to_string),
        })
    }

    pub fn load(path: &Path) -> Result<Self, DiffIndexError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| DiffIndexError::Read(e.to_string()))?;
        Self::parse(&text)
    }

    /// Whether the server already merged its patches.
    pub fn server_merged(&self) -> bool {
        self.precedence.as_deref() == Some("merged")
    }

    /// Decide how to bring an index with hash `local_sha1` up to date.
    ///
    /// Patches are taken from the first history entry matching the local
    /// hash through the end of the history, in listed order.
    pub fn plan(&self, local_sha1: &str, limits: PatchLimits) -> PatchPlan {
        if local_sha1 == self.server_sha1 {
            return PatchPlan::UpToDate;
        }

        let Some(start) = self.history.iter().position(|d| d.sha1 == local_sha1) else {
            return PatchPlan::Fallback(FallbackReason::NoMatch);
        };
        let needed: Vec<DiffInfo> = self.history[start..].to_vec();

        if limits.file_limit != 0 && limits.file_limit < needed.len() {
            return PatchPlan::Fallback(FallbackReason::TooManyPatches {
                needed: needed.len(),
                limit: limits.file_limit,
            });
        }

        let first = &needed[0].file;
        let patches_size: u64 = self
            .patches
            .iter()
            .skip_while(|p| &p.file != first)
            .map(|p| p.size)
            .sum();
        let size_limit = self.server_size.saturating_mul(limits.size_limit_percent);
        if size_limit > 0 && size_limit / 100 < patches_size {
            return PatchPlan::Fallback(FallbackReason::TooLarge {
                size: patches_size,
                limit: size_limit / 100,
            });
        }

        PatchPlan::Patches(needed)
    }
}

fn parse_triples(lines: &[&str]) -> Vec<DiffInfo> {
    lines
        .iter()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let sha1 = parts.next()?;
            let size = parts.next()?.parse().ok()?;
            let file = parts.next()?;
            Some(DiffInfo {
                sha1: sha1.to_string(),
                size,
                file: file.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = concat!(
        "SHA1-Current: ffff 1000\n",
        "SHA1-History:\n",
        " h0 900 2024-01-01-0000.00\n",
        " h1 920 2024-01-02-0000.00\n",
        " h2 950 2024-01-03-0000.00\n",
        " h3 970 2024-01-04-0000.00\n",
        " h4 990 2024-01-05-0000.00\n",
        "SHA1-Patches:\n",
        " p0 100 2024-01-01-0000.00\n",
        " p1 110 2024-01-02-0000.00\n",
        " p2 120 2024-01-03-0000.00\n",
        " p3 130 2024-01-04-0000.00\n",
        " p4 140 2024-01-05-0000.00\n",
    );

    #[test]
    fn test_parse_diff_index() {
        let index = DiffIndex::parse(INDEX).unwrap();
        assert_eq!(index.server_sha1, "ffff");
        assert_eq!(index.server_size, 1000);
        assert_eq!(index.history.len(), 5);
        assert_eq!(index.patches[4].size, 140);
        assert!(!index.server_merged());
    }

    #[test]
    fn test_plan_up_to_date() {
        let index = DiffIndex::parse(INDEX).unwrap();
        assert_eq!(index.plan("ffff", PatchLimits::default()), PatchPlan::UpToDate);
    }

    #[test]
    fn test_plan_from_middle_of_history() {
        let index = DiffIndex::parse(INDEX).unwrap();
        let PatchPlan::Patches(patches) = index.plan("h2", PatchLimits::default()) else {
            panic!("expected patches");
        };
        let names: Vec<_> = patches.iter().map(|p| p.file.as_str()).collect();
        assert_eq!(
            names,
            vec!["2024-01-03-0000.00", "2024-01-04-0000.00", "2024-01-05-0000.00"]
        );
    }

    #[test]
    fn test_plan_unknown_local_falls_back() {
        let index = DiffIndex::parse(INDEX).unwrap();
        assert_eq!(
            index.plan("zzzz", PatchLimits::default()),
            PatchPlan::Fallback(FallbackReason::NoMatch)
        );
    }

    #[test]
    fn test_plan_file_limit() {
        let index = DiffIndex::parse(INDEX).unwrap();
        let limits = PatchLimits {
            file_limit: 2,
            size_limit_percent: 100,
        };
        assert_eq!(
            index.plan("h2", limits),
            PatchPlan::Fallback(FallbackReason::TooManyPatches { needed: 3, limit: 2 })
        );
        let limits = PatchLimits {
            file_limit: 3,
            size_limit_percent: 100,
        };
        assert!(matches!(index.plan("h2", limits), PatchPlan::Patches(_)));
    }

    #[test]
    fn test_plan_size_limit() {
        let index = DiffIndex::parse(INDEX).unwrap();
        // patches from h2 weigh 120 + 130 + 140 = 390 bytes of a 1000 byte index
        let limits = PatchLimits {
            file_limit: 0,
            size_limit_percent: 38,
        };
        assert_eq!(
            index.plan("h2", limits),
            PatchPlan::Fallback(FallbackReason::TooLarge { size: 390, limit: 380 })
        );
        let limits = PatchLimits {
            file_limit: 0,
            size_limit_percent: 39,
        };
        assert!(matches!(index.plan("h2", limits), PatchPlan::Patches(_)));
    }

    #[test]
    fn test_merged_precedence() {
        let index = DiffIndex::parse("SHA1-Current: a 1\nX-Patch-Precedence: merged\n").unwrap();
        assert!(index.server_merged());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn chain(n: usize) -> DiffIndex {
            let history = (0..n)
                .map(|i| DiffInfo {
                    sha1: format!("h{}", i),
                    size: 1000,
                    file: format!("patch-{:03}", i),
                })
                .collect::<Vec<_>>();
            let patches = (0..n)
                .map(|i| DiffInfo {
                    sha1: format!("p{}", i),
                    size: 10,
                    file: format!("patch-{:03}", i),
                })
                .collect();
            DiffIndex {
                server_sha1: "current".to_string(),
                server_size: 1000,
                history,
                patches,
                precedence: None,
            }
        }

        proptest! {
            #[test]
            fn prop_plan_takes_suffix_in_order(n in 1usize..40, k_seed in 0usize..40) {
                let k = k_seed % n;
                let index = chain(n);
                let limits = PatchLimits { file_limit: 0, size_limit_percent: 100 };
                let plan = index.plan(&format!("h{}", k), limits);
                let PatchPlan::Patches(patches) = plan else {
                    return Err(TestCaseError::fail("expected patches"));
                };
                prop_assert_eq!(patches.len(), n - k);
                prop_assert_eq!(&patches[..], &index.history[k..]);
            }

            #[test]
            fn prop_file_limit_never_queues_over_limit(
                n in 1usize..40,
                k_seed in 0usize..40,
                limit in 1usize..40,
            ) {
                let k = k_seed % n;
                let index = chain(n);
                let limits = PatchLimits { file_limit: limit, size_limit_percent: 100 };
                match index.plan(&format!("h{}", k), limits) {
                    PatchPlan::Patches(p) => prop_assert!(p.len() <= limit),
                    PatchPlan::Fallback(FallbackReason::TooManyPatches { needed, .. }) => {
                        prop_assert!(needed > limit)
                    }
                    other => return Err(TestCaseError::fail(format!("unexpected {:?}", other))),
                }
            }

            #[test]
            fn prop_size_limit_never_queues_over_budget(
                n in 1usize..40,
                k_seed in 0usize..40,
                percent in 0u64..60,
            ) {
                let k = k_seed % n;
                let index = chain(n);
                let limits = PatchLimits { file_limit: 0, size_limit_percent: percent };
                if let PatchPlan::Patches(p) = index.plan(&format!("h{}", k), limits) {
                    let bytes = p.len() as u64 * 10;
                    prop_assert!(percent == 0 || bytes <= 1000 * percent / 100);
                }
            }
        }
    }
}
