//! Descriptors handed to the engine by whoever reads the source list.
//!
//! The engine does not parse source lists or package caches itself. It is
//! seeded with release sources (which expand into index targets) and with
//! package versions whose candidate files have already been looked up.

use crate::hashes::{HashString, HashType};
use crate::item::ItemDesc;

/// One index a release is expected to describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTarget {
    /// Full URI of the uncompressed index.
    pub uri: String,
    pub description: String,
    pub short_desc: String,
    /// Path of the index relative to the release file, e.g. `main/binary-amd64/Packages`.
    pub meta_key: String,
    pub optional: bool,
    pub sub_index: bool,
}

impl IndexTarget {
    pub fn new(
        uri: impl Into<String>,
        description: impl Into<String>,
        short_desc: impl Into<String>,
        meta_key: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            description: description.into(),
            short_desc: short_desc.into(),
            meta_key: meta_key.into(),
            optional: false,
            sub_index: false,
        }
    }

    /// Mark as optional content (translations and the like).
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn sub_index(mut self) -> Self {
        self.optional = true;
        self.sub_index = true;
        self
    }
}

/// The metadata files of one distribution and the indexes they describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSource {
    /// Clear-signed release, tried first when present.
    pub inrelease: Option<ItemDesc>,
    pub release: ItemDesc,
    /// Detached signature of `release`.
    pub signature: ItemDesc,
    /// Distribution name the release must match.
    pub dist: String,
    pub targets: Vec<IndexTarget>,
}

impl ReleaseSource {
    /// Standard layout under `<base>dists/<dist>/`.
    pub fn for_dist(base: &str, dist: &str, site: &str) -> Self {
        let root = format!("{}dists/{}/", base, dist);
        let describe = |name: &str| {
            ItemDesc::new(
                format!("{}{}", root, name),
                format!("{} {} {}", site, dist, name),
                name,
            )
        };
        Self {
            inrelease: Some(describe("InRelease")),
            release: describe("Release"),
            signature: describe("Release.gpg"),
            dist: dist.to_string(),
            targets: Vec::new(),
        }
    }

    pub fn without_inrelease(mut self) -> Self {
        self.inrelease = None;
        self
    }

    pub fn with_target(mut self, target: IndexTarget) -> Self {
        self.targets.push(target);
        self
    }
}

/// Checksums and file name of one package record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageRecord {
    /// Path relative to the archive root.
    pub filename: String,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
}

impl PackageRecord {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn with_hash(mut self, kind: HashType, value: impl Into<String>) -> Self {
        let value = value.into();
        match kind {
            HashType::Md5Sum => self.md5 = value,
            HashType::Sha1 => self.sha1 = value,
            HashType::Sha256 => self.sha256 = value,
            HashType::Sha512 => self.sha512 = value,
        }
        self
    }

    fn value(&self, kind: HashType) -> &str {
        match kind {
            HashType::Md5Sum => &self.md5,
            HashType::Sha1 => &self.sha1,
            HashType::Sha256 => &self.sha256,
            HashType::Sha512 => &self.sha512,
        }
    }

    /// The forced family if requested, else the strongest one present.
    pub fn expected_hash(&self, force: Option<HashType>) -> HashString {
        if let Some(kind) = force {
            let value = self.value(kind);
            return if value.is_empty() {
                HashString::default()
            } else {
                HashString::new(kind, value)
            };
        }
        HashType::STRONGEST_FIRST
            .into_iter()
            .find(|kind| !self.value(*kind).is_empty())
            .map(|kind| HashString::new(kind, self.value(kind)))
            .unwrap_or_default()
    }
}

/// The index a candidate file was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndex {
    /// Archive root the record's file name is relative to.
    pub base_uri: String,
    pub trusted: bool,
    /// Human label, e.g. `http://deb.debian.org/debian sid/main`.
    pub label: String,
}

/// One place a package version is available from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFile {
    /// Flagged as not a download source (the status file, for instance).
    pub not_source: bool,
    /// `None` when no configured source provides this file.
    pub index: Option<ArchiveIndex>,
    pub record: Option<PackageRecord>,
}

impl VersionFile {
    pub fn new(index: ArchiveIndex, record: PackageRecord) -> Self {
        Self {
            not_source: false,
            index: Some(index),
            record: Some(record),
        }
    }
}

/// A package version to fetch, with every candidate file in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageVersion {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub size: u64,
    pub files: Vec<VersionFile>,
}

/// A standalone file download.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileRequest {
    pub uri: String,
    pub expected_hash: HashString,
    pub size: u64,
    pub description: String,
    pub short_desc: String,
    /// Directory for the file when `dest_filename` is empty.
    pub dest_dir: Option<std::path::PathBuf>,
    pub dest_filename: Option<std::path::PathBuf>,
    pub is_index: bool,
}

impl FileRequest {
    pub fn new(uri: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            uri: uri.into(),
            short_desc: description.clone(),
            description,
            ..Self::default()
        }
    }

    pub fn with_hash(mut self, hash: HashString) -> Self {
        self.expected_hash = hash;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_dest_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.dest_dir = Some(dir.into());
        self
    }

    pub fn with_dest_filename(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.dest_filename = Some(path.into());
        self
    }

    pub fn as_index(mut self) -> Self {
        self.is_index = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_hash_prefers_sha512() {
        let record = PackageRecord::new("pool/f/foo.deb")
            .with_hash(HashType::Md5Sum, "aa")
            .with_hash(HashType::Sha256, "bb")
            .with_hash(HashType::Sha512, "cc");
        assert_eq!(record.expected_hash(None).to_string(), "SHA512:cc");
    }

    #[test]
    fn test_expected_hash_force() {
        let record = PackageRecord::new("x")
            .with_hash(HashType::Md5Sum, "aa")
            .with_hash(HashType::Sha512, "cc");
        assert_eq!(
            record.expected_hash(Some(HashType::Md5Sum)).to_string(),
            "MD5Sum:aa"
        );
        assert!(record.expected_hash(Some(HashType::Sha1)).is_empty());
    }

    #[test]
    fn test_release_source_layout() {
        let source = ReleaseSource::for_dist("http://deb.example.org/debian/", "sid", "deb.example.org");
        assert_eq!(
            source.inrelease.as_ref().unwrap().uri,
            "http://deb.example.org/debian/dists/sid/InRelease"
        );
        assert_eq!(
            source.signature.uri,
            "http://deb.example.org/debian/dists/sid/Release.gpg"
        );
        assert!(source.without_inrelease().inrelease.is_none());
    }

    #[test]
    fn test_sub_index_is_optional() {
        let target = IndexTarget::new("u", "d", "s", "k").sub_index();
        assert!(target.optional);
        assert!(target.sub_index);
    }
}
