//! RFC822-style stanza reader.
//!
//! Release files, diff indexes and package indexes all use the same shape:
//! `Key: value` lines, continuation lines starting with whitespace, and
//! stanzas separated by blank lines.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

/// Errors from parsing tag sections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TagFileError {
    /// A line that is neither a field nor a continuation.
    #[error("line {line}: malformed field {text:?}")]
    MalformedField { line: usize, text: String },

    /// A continuation line appeared before any field.
    #[error("line {line}: continuation line without a field")]
    OrphanContinuation { line: usize },

    /// The file could not be read.
    #[error("failed to read tag file: {0}")]
    Io(String),
}

/// One stanza of fields, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    fields: Vec<(String, String)>,
}

impl Section {
    /// Look up a field, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Non-empty lines of a multi-line field.
    pub fn lines(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|v| v.lines().map(str::trim).filter(|l| !l.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Incremental stanza builder shared by the string and file readers.
#[derive(Default)]
struct SectionBuilder {
    current: Section,
}

impl SectionBuilder {
    fn push_line(&mut self, line_no: usize, line: &str) -> Result<(), TagFileError> {
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some((_, value)) = self.current.fields.last_mut() else {
                return Err(TagFileError::OrphanContinuation { line: line_no });
            };
            value.push('\n');
            value.push_str(line.trim());
            return Ok(());
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(TagFileError::MalformedField {
                line: line_no,
                text: line.to_string(),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(TagFileError::MalformedField {
                line: line_no,
                text: line.to_string(),
            });
        }
        self.current
            .fields
            .push((key.to_string(), value.trim().to_string()));
        Ok(())
    }

    fn take(&mut self) -> Option<Section> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

/// Parse every stanza in `text`.
pub fn parse_sections(text: &str) -> Result<Vec<Section>, TagFileError> {
    let mut sections = Vec::new();
    let mut builder = SectionBuilder::default();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            sections.extend(builder.take());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        builder.push_line(idx + 1, line)?;
    }
    sections.extend(builder.take());

    Ok(sections)
}

/// Parse a single stanza; trailing stanzas are ignored.
pub fn parse_section(text: &str) -> Result<Section, TagFileError> {
    Ok(parse_sections(text)?.into_iter().next().unwrap_or_default())
}

/// Read only the first stanza of a file, without loading the rest.
pub fn read_first_section(path: &Path) -> Result<Option<Section>, TagFileError> {
    let file = File::open(path).map_err(|e| TagFileError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut builder = SectionBuilder::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| TagFileError::Io(e.to_string()))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if let Some(section) = builder.take() {
                return Ok(Some(section));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        builder.push_line(idx + 1, line)?;
    }

    Ok(builder.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_parse_single_section() {
        let section = parse_section("Package: foo\nVersion: 1.0\n").unwrap();
        assert_eq!(section.get("Package"), Some("foo"));
        assert_eq!(section.get("version"), Some("1.0"));
        assert!(!section.contains("Architecture"));
    }

    #[test]
    fn test_parse_continuation_lines() {
        let text = "SHA1-History:\n abc 10 p1\n def 20 p2\nX: y\n";
        let section = parse_section(text).unwrap();
        assert_eq!(section.lines("SHA1-History"), vec!["abc 10 p1", "def 20 p2"]);
        assert_eq!(section.get("X"), Some("y"));
    }

    #[test]
    fn test_parse_multiple_sections() {
        let text = "Package: a\n\n\nPackage: b\nDepends: c\n\n";
        let sections = parse_sections(text).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].get("Depends"), Some("c"));
    }

    #[test]
    fn test_orphan_continuation_is_error() {
        let err = parse_sections(" leading\n").unwrap_err();
        assert_eq!(err, TagFileError::OrphanContinuation { line: 1 });
    }

    #[test]
    fn test_malformed_field_is_error() {
        let err = parse_sections("<html>\n").unwrap_err();
        assert!(matches!(err, TagFileError::MalformedField { line: 1, .. }));
    }

    #[test]
    fn test_read_first_section_stops_at_blank_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Packages");
        let mut file = File::create(&path).unwrap();
        write!(file, "\nPackage: foo\nVersion: 1\n\nthis is not parsed\n").unwrap();

        let section = read_first_section(&path).unwrap().unwrap();
        assert_eq!(section.get("Package"), Some("foo"));
    }

    #[test]
    fn test_read_first_section_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Packages");
        File::create(&path).unwrap();
        assert!(read_first_section(&path).unwrap().is_none());
    }
}
