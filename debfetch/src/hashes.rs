//! Digest calculation and expected-hash verification.
//!
//! Repository metadata names four digest families. Completed downloads are
//! hashed with all of them in one pass so a worker's "Done" message can carry
//! every field, and items compare against whichever family their trusted
//! metadata supplied.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{AcquireError, AcquireResult};

/// Buffer size for reading files during hash calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// A digest family understood by repository metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashType {
    Md5Sum,
    Sha1,
    Sha256,
    Sha512,
}

impl HashType {
    /// All families, strongest first.
    pub const STRONGEST_FIRST: [HashType; 4] = [
        HashType::Sha512,
        HashType::Sha256,
        HashType::Sha1,
        HashType::Md5Sum,
    ];

    /// Canonical name as used in `Type:value` strings and Release sections.
    pub fn name(&self) -> &'static str {
        match self {
            HashType::Md5Sum => "MD5Sum",
            HashType::Sha1 => "SHA1",
            HashType::Sha256 => "SHA256",
            HashType::Sha512 => "SHA512",
        }
    }

    /// Parse a family name, case-insensitively. `MD5` is accepted for `MD5Sum`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5sum" | "md5" => Some(HashType::Md5Sum),
            "sha1" => Some(HashType::Sha1),
            "sha256" => Some(HashType::Sha256),
            "sha512" => Some(HashType::Sha512),
            _ => None,
        }
    }

    /// Field name carrying this digest in worker messages.
    pub fn message_field(&self) -> &'static str {
        match self {
            HashType::Md5Sum => "MD5-Hash",
            HashType::Sha1 => "SHA1-Hash",
            HashType::Sha256 => "SHA256-Hash",
            HashType::Sha512 => "SHA512-Hash",
        }
    }

    /// Length of the hex encoding of this digest.
    pub fn hex_len(&self) -> usize {
        match self {
            HashType::Md5Sum => 32,
            HashType::Sha1 => 40,
            HashType::Sha256 => 64,
            HashType::Sha512 => 128,
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An expected digest: family plus lowercase hex value.
///
/// The empty `HashString` means "no expectation" and callers skip
/// verification when `is_empty()` is true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashString {
    kind: Option<HashType>,
    value: String,
}

impl HashString {
    /// Create a hash string from a family and hex value.
    pub fn new(kind: HashType, value: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            value: value.into().to_ascii_lowercase(),
        }
    }

    /// Parse `Type:hex`. A bare hex value is taken as `MD5Sum`.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Self::default();
        }
        match s.split_once(':') {
            Some((kind, value)) => match HashType::from_name(kind) {
                Some(kind) => Self::new(kind, value.trim()),
                None => Self::default(),
            },
            None => Self::new(HashType::Md5Sum, s),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none() || self.value.is_empty()
    }

    pub fn hash_type(&self) -> Option<HashType> {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Compare against a set of computed digests.
    pub fn matches(&self, hashes: &Hashes) -> bool {
        match self.kind {
            Some(kind) if !self.value.is_empty() => hashes.get(kind) == self.value,
            _ => false,
        }
    }

    /// Hash `path` with this string's family and compare.
    ///
    /// An empty expectation never verifies.
    pub fn verify_file(&self, path: &Path) -> AcquireResult<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        Ok(self.matches(&Hashes::from_file(path)?))
    }
}

impl fmt::Display for HashString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) if !self.value.is_empty() => write!(f, "{}:{}", kind.name(), self.value),
            _ => Ok(()),
        }
    }
}

/// All four digests of one byte stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hashes {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
}

impl Hashes {
    /// Hash everything `reader` yields.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut md5 = Md5::new();
        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut sha512 = Sha512::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            let chunk = &buffer[..bytes_read];
            md5.update(chunk);
            sha1.update(chunk);
            sha256.update(chunk);
            sha512.update(chunk);
        }

        Ok(Self {
            md5: format!("{:x}", md5.finalize()),
            sha1: format!("{:x}", sha1.finalize()),
            sha256: format!("{:x}", sha256.finalize()),
            sha512: format!("{:x}", sha512.finalize()),
        })
    }

    /// Hash the contents of a file.
    pub fn from_file(path: &Path) -> AcquireResult<Self> {
        let file = File::open(path).map_err(|e| AcquireError::read(path, e))?;
        Self::from_reader(file).map_err(|e| AcquireError::read(path, e))
    }

    /// Hash an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        // Reading from a slice cannot fail.
        Self::from_reader(data).unwrap_or_default()
    }

    pub fn get(&self, kind: HashType) -> &str {
        match kind {
            HashType::Md5Sum => &self.md5,
            HashType::Sha1 => &self.sha1,
            HashType::Sha256 => &self.sha256,
            HashType::Sha512 => &self.sha512,
        }
    }

    /// `(message field, value)` pairs for a worker "Done" message.
    pub fn message_fields(&self) -> Vec<(&'static str, String)> {
        HashType::STRONGEST_FIRST
            .iter()
            .rev()
            .map(|kind| (kind.message_field(), self.get(*kind).to_string()))
            .collect()
    }
}

/// SHA1 of a file, used to locate a local index in a diff history.
pub fn sha1_file(path: &Path) -> AcquireResult<String> {
    let mut file = File::open(path).map_err(|e| AcquireError::read(path, e))?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| AcquireError::read(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_hashes_of_hello_world() {
        let hashes = Hashes::from_bytes(b"hello world");
        assert_eq!(hashes.md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(hashes.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(
            hashes.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(hashes.sha512.len(), 128);
    }

    #[test]
    fn test_hashes_of_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty");
        File::create(&path).unwrap();

        let hashes = Hashes::from_file(&path).unwrap();
        assert_eq!(
            hashes.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha1_file(&path).unwrap(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_from_file_missing() {
        let temp = TempDir::new().unwrap();
        let result = Hashes::from_file(&temp.path().join("missing"));
        assert!(matches!(result, Err(AcquireError::ReadFailed { .. })));
    }

    #[test]
    fn test_hash_string_parse_typed() {
        let h = HashString::parse("SHA256:ABCDEF");
        assert_eq!(h.hash_type(), Some(HashType::Sha256));
        assert_eq!(h.value(), "abcdef");
        assert_eq!(h.to_string(), "SHA256:abcdef");
    }

    #[test]
    fn test_hash_string_bare_value_is_md5() {
        let h = HashString::parse("5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(h.hash_type(), Some(HashType::Md5Sum));
        assert_eq!(h.to_string(), "MD5Sum:5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_hash_string_empty_and_unknown() {
        assert!(HashString::parse("").is_empty());
        assert!(HashString::parse("CRC32:1234").is_empty());
        assert_eq!(HashString::default().to_string(), "");
    }

    #[test]
    fn test_verify_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"hello world").unwrap();

        let good = HashString::new(
            HashType::Sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        );
        let bad = HashString::new(HashType::Sha1, "0000");
        assert!(good.verify_file(&path).unwrap());
        assert!(!bad.verify_file(&path).unwrap());
        assert!(!HashString::default().verify_file(&path).unwrap());
    }

    #[test]
    fn test_message_fields_cover_every_family() {
        let fields = Hashes::from_bytes(b"x").message_fields();
        let names: Vec<_> = fields.iter().map(|(k, _)| *k).collect();
        assert_eq!(names, vec!["MD5-Hash", "SHA1-Hash", "SHA256-Hash", "SHA512-Hash"]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_typed_hash_string_survives_display(
                idx in 0usize..4,
                value in "[0-9a-f]{8,64}",
            ) {
                let kind = HashType::STRONGEST_FIRST[idx];
                let text = format!("{}:{}", kind.name().to_lowercase(), value);
                let parsed = HashString::parse(&text);
                prop_assert_eq!(parsed.hash_type(), Some(kind));
                prop_assert_eq!(HashString::parse(&parsed.to_string()), parsed);
            }
        }
    }
}
