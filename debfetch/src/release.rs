//! Parsed repository release metadata.
//!
//! A Release (or InRelease) file names every index of a distribution
//! together with its size and digests. Items use it to decide which
//! compressed variants exist and which hash to expect.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;

use crate::gpgv::open_maybe_clearsigned;
use crate::hashes::{HashString, HashType};
use crate::tagfile::{self, Section};
use crate::uri::parse_rfc1123;

/// Errors from loading a release file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("Unable to parse Release file {}", path.display())]
    Unparsable { path: PathBuf },

    #[error("No sections in Release file {}", path.display())]
    NoSections { path: PathBuf },

    #[error("No Hash entry in Release file {}", path.display())]
    NoHashEntry { path: PathBuf },

    #[error("Invalid 'Valid-Until' entry in Release file {}", path.display())]
    InvalidValidUntil { path: PathBuf },

    #[error("Malformed checksum line {line:?} in Release file {}", path.display())]
    BadChecksumLine { path: PathBuf, line: String },
}

/// One index named by the release file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub meta_key: String,
    pub hash: HashString,
    pub size: u64,
}

/// Index records of one distribution.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFile {
    expected_dist: String,
    suite: String,
    codename: String,
    valid_until: i64,
    entries: BTreeMap<String, ReleaseEntry>,
}

impl ReleaseFile {
    /// An empty record set expecting the given distribution name.
    pub fn new(expected_dist: impl Into<String>) -> Self {
        Self {
            expected_dist: expected_dist.into(),
            ..Self::default()
        }
    }

    /// Load and parse `path`, which may be clear-signed.
    pub fn load(&mut self, path: &Path) -> Result<(), ReleaseError> {
        let text = open_maybe_clearsigned(path).map_err(|_| ReleaseError::Unparsable {
            path: path.to_path_buf(),
        })?;
        self.parse(&text, path)
    }

    /// Parse release text; `origin` is only used in error messages.
    pub fn parse(&mut self, text: &str, origin: &Path) -> Result<(), ReleaseError> {
        let origin = origin.to_path_buf();
        let sections = tagfile::parse_sections(text).map_err(|_| ReleaseError::Unparsable {
            path: origin.clone(),
        })?;
        let Some(section) = sections.into_iter().next() else {
            return Err(ReleaseError::NoSections { path: origin });
        };

        self.suite = section.get("Suite").unwrap_or("").to_string();
        self.codename = section.get("Codename").unwrap_or("").to_string();

        let kind = HashType::STRONGEST_FIRST
            .into_iter()
            .find(|kind| section.contains(kind.name()))
            .ok_or_else(|| ReleaseError::NoHashEntry {
                path: origin.clone(),
            })?;
        self.entries = parse_checksums(&section, kind, &origin)?;

        self.valid_until = match section.get("Valid-Until") {
            Some(value) if !value.is_empty() => parse_rfc1123(value)
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .ok_or(ReleaseError::InvalidValidUntil { path: origin })?,
            _ => 0,
        };

        Ok(())
    }

    pub fn lookup(&self, meta_key: &str) -> Option<&ReleaseEntry> {
        self.entries.get(meta_key)
    }

    pub fn exists(&self, meta_key: &str) -> bool {
        self.entries.contains_key(meta_key)
    }

    pub fn meta_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The suite name, as reported in conflict warnings.
    pub fn dist(&self) -> &str {
        &self.suite
    }

    pub fn codename(&self) -> &str {
        &self.codename
    }

    pub fn expected_dist(&self) -> &str {
        &self.expected_dist
    }

    /// Unix time after which the file is stale, 0 when unlimited.
    pub fn valid_until(&self) -> i64 {
        self.valid_until
    }

    /// Whether `dist` names this release by codename or suite.
    pub fn check_dist(&self, dist: &str) -> bool {
        self.codename == dist || self.suite == dist
    }
}

fn parse_checksums(
    section: &Section,
    kind: HashType,
    origin: &Path,
) -> Result<BTreeMap<String, ReleaseEntry>, ReleaseError> {
    let mut entries = BTreeMap::new();
    for line in section.lines(kind.name()) {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ReleaseError::BadChecksumLine {
                path: origin.to_path_buf(),
                line: line.to_string(),
            });
        };
        let size = size.parse().map_err(|_| ReleaseError::BadChecksumLine {
            path: origin.to_path_buf(),
            line: line.to_string(),
        })?;
        entries.insert(
            name.to_string(),
            ReleaseEntry {
                meta_key: name.to_string(),
                hash: HashString::new(kind, hash),
                size,
            },
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const RELEASE: &str = concat!(
        "Origin: Debian\n",
        "Suite: unstable\n",
        "Codename: sid\n",
        "Date: Sat, 12 Oct 2024 08:12:34 UTC\n",
        "Valid-Until: Sat, 19 Oct 2024 08:12:34 UTC\n",
        "MD5Sum:\n",
        " 0123 10 main/binary-amd64/Packages\n",
        "SHA256:\n",
        " aaaa 10 main/binary-amd64/Packages\n",
        " bbbb 4 main/binary-amd64/Packages.gz\n",
        " cccc 99 main/binary-amd64/Packages.diff/Index\n",
    );

    #[test]
    fn test_parse_release_prefers_strongest_section() {
        let mut release = ReleaseFile::new("sid");
        release.parse(RELEASE, Path::new("Release")).unwrap();

        let entry = release.lookup("main/binary-amd64/Packages").unwrap();
        assert_eq!(entry.hash.to_string(), "SHA256:aaaa");
        assert_eq!(entry.size, 10);
        assert!(release.exists("main/binary-amd64/Packages.gz"));
        assert!(release.exists("main/binary-amd64/Packages.diff/Index"));
        assert_eq!(release.meta_keys().count(), 3);
        assert_eq!(release.dist(), "unstable");
        assert!(release.check_dist("sid"));
        assert!(release.check_dist("unstable"));
        assert!(!release.check_dist("stable"));
        assert!(release.valid_until() > 0);
    }

    #[test]
    fn test_no_hash_entry_is_error() {
        let mut release = ReleaseFile::default();
        let err = release.parse("Suite: sid\n", Path::new("Release")).unwrap_err();
        assert!(matches!(err, ReleaseError::NoHashEntry { .. }));
    }

    #[test]
    fn test_invalid_valid_until_is_error() {
        let mut release = ReleaseFile::default();
        let text = "Suite: sid\nValid-Until: whenever\nSHA1:\n 00 1 a\n";
        let err = release.parse(text, Path::new("Release")).unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidValidUntil { .. }));
    }

    #[test]
    fn test_bad_checksum_line() {
        let mut release = ReleaseFile::default();
        let err = release
            .parse("SHA256:\n abc notasize name\n", Path::new("Release"))
            .unwrap_err();
        assert!(matches!(err, ReleaseError::BadChecksumLine { .. }));
    }

    #[test]
    fn test_load_clearsigned() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("InRelease");
        let signed = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n{}-----BEGIN PGP SIGNATURE-----\nabc\n-----END PGP SIGNATURE-----\n",
            RELEASE
        );
        fs::write(&path, signed).unwrap();

        let mut release = ReleaseFile::new("sid");
        release.load(&path).unwrap();
        assert!(release.exists("main/binary-amd64/Packages.gz"));
        assert_eq!(release.expected_dist(), "sid");
    }

    #[test]
    fn test_load_garbage_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Release");
        fs::write(&path, "<html>\n<body>captive portal</body>\n").unwrap();
        assert!(ReleaseFile::default().load(&path).is_err());
    }
}
