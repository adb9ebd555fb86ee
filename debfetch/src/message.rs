//! Tag-value messages exchanged with transport workers.
//!
//! # Wire format
//!
//! ```text
//! 600 URI Acquire
//! URI: http://deb.example.org/debian/dists/sid/InRelease
//! Filename: /var/lib/apt/lists/partial/deb.example.org_debian_dists_sid_InRelease
//! Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT
//!
//! ```
//!
//! A status line `NNN Text`, `Key: Value` fields, a blank line. Values that
//! span lines continue with a leading space.

use std::io::{self, BufRead};

use thiserror::Error;

/// `100 Capabilities`
pub const CAPABILITIES: u16 = 100;
/// `101 Log`
pub const LOG: u16 = 101;
/// `102 Status`
pub const STATUS: u16 = 102;
/// `103 Redirect`
pub const REDIRECT: u16 = 103;
/// `200 URI Start`
pub const URI_START: u16 = 200;
/// `201 URI Done`
pub const URI_DONE: u16 = 201;
/// `400 URI Failure`
pub const URI_FAILURE: u16 = 400;
/// `401 General Failure`
pub const GENERAL_FAILURE: u16 = 401;
/// `600 URI Acquire`
pub const URI_ACQUIRE: u16 = 600;
/// `601 Configuration`
pub const CONFIGURATION: u16 = 601;

/// Errors from decoding a message block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,

    #[error("malformed status line {0:?}")]
    BadStatusLine(String),

    #[error("malformed field {0:?}")]
    BadField(String),
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub text: String,
    fields: Vec<(String, String)>,
}

impl Message {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            fields: Vec::new(),
        }
    }

    /// Builder form of [`Message::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Append a field. Empty values are dropped.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.fields.push((key.into(), value));
        }
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Field value by case-insensitive name.
    pub fn lookup(&self, tag: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(tag))
            .map(|(_, v)| v.as_str())
    }

    /// Field value or the empty string.
    pub fn get(&self, tag: &str) -> &str {
        self.lookup(tag).unwrap_or("")
    }

    pub fn lookup_bool(&self, tag: &str, default: bool) -> bool {
        match self.lookup(tag) {
            Some(v) => string_to_bool(v, default),
            None => default,
        }
    }

    pub fn lookup_u64(&self, tag: &str) -> u64 {
        self.lookup(tag)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Serialise to the wire format, including the terminating blank line.
    pub fn encode(&self) -> String {
        let mut out = format!("{} {}\n", self.code, self.text);
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            let mut lines = value.split('\n');
            if let Some(first) = lines.next() {
                out.push_str(first);
            }
            for line in lines {
                out.push_str("\n ");
                out.push_str(line);
            }
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Decode one message block (without the terminating blank line).
    pub fn parse(block: &str) -> Result<Self, MessageError> {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty());
        let status = lines.next().ok_or(MessageError::Empty)?;

        let (code, text) = status
            .split_once(' ')
            .map(|(c, t)| (c, t.trim()))
            .unwrap_or((status, ""));
        let code: u16 = code
            .trim()
            .parse()
            .map_err(|_| MessageError::BadStatusLine(status.to_string()))?;

        let mut message = Message::new(code, text);
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                match message.fields.last_mut() {
                    Some((_, value)) => {
                        value.push('\n');
                        value.push_str(line.trim());
                    }
                    None => return Err(MessageError::BadField(line.to_string())),
                }
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| MessageError::BadField(line.to_string()))?;
            message
                .fields
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(message)
    }
}

/// Interpret the usual yes/no spellings.
pub fn string_to_bool(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "with" | "on" | "enable" | "1" => true,
        "no" | "false" | "without" | "off" | "disable" | "0" => false,
        _ => default,
    }
}

/// Reads blank-line-terminated messages from a byte stream.
pub struct MessageReader<R> {
    reader: R,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next message, or `None` at end of stream.
    pub fn next_message(&mut self) -> io::Result<Option<Message>> {
        let mut block = String::new();
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                if block.trim().is_empty() {
                    return Ok(None);
                }
                break;
            }
            if line.trim().is_empty() {
                if block.trim().is_empty() {
                    continue;
                }
                break;
            }
            block.push_str(&line);
        }

        Message::parse(&block)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_acquire() {
        let msg = Message::new(URI_ACQUIRE, "URI Acquire")
            .with("URI", "http://h/x")
            .with("Filename", "/tmp/x")
            .with("Last-Modified", "");
        assert_eq!(
            msg.encode(),
            "600 URI Acquire\nURI: http://h/x\nFilename: /tmp/x\n\n"
        );
    }

    #[test]
    fn test_parse_done_message() {
        let msg = Message::parse("201 URI Done\nURI: http://h/x\nSize: 42\nIMS-Hit: true\n").unwrap();
        assert_eq!(msg.code, URI_DONE);
        assert_eq!(msg.text, "URI Done");
        assert_eq!(msg.get("uri"), "http://h/x");
        assert_eq!(msg.lookup_u64("Size"), 42);
        assert!(msg.lookup_bool("IMS-Hit", false));
        assert!(!msg.lookup_bool("Alt-IMS-Hit", false));
    }

    #[test]
    fn test_multiline_field_survives_encode() {
        let msg = Message::new(URI_DONE, "URI Done").with("GPGVOutput", "GOODSIG AAAA\nNO_PUBKEY BBBB");
        let parsed = Message::parse(&msg.encode()).unwrap();
        assert_eq!(parsed.get("GPGVOutput"), "GOODSIG AAAA\nNO_PUBKEY BBBB");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Message::parse("\n\n"), Err(MessageError::Empty));
        assert!(matches!(
            Message::parse("abc Nope\n"),
            Err(MessageError::BadStatusLine(_))
        ));
        assert!(matches!(
            Message::parse("200 URI Start\nno colon here\n"),
            Err(MessageError::BadField(_))
        ));
    }

    #[test]
    fn test_string_to_bool() {
        assert!(string_to_bool("Yes", false));
        assert!(string_to_bool("enable", false));
        assert!(!string_to_bool("off", true));
        assert!(string_to_bool("maybe", true));
    }

    #[test]
    fn test_reader_splits_stream() {
        let stream = "100 Capabilities\nVersion: 1.0\nPipeline: true\n\n\n200 URI Start\nURI: a\n\n";
        let mut reader = MessageReader::new(Cursor::new(stream));
        let first = reader.next_message().unwrap().unwrap();
        assert_eq!(first.code, CAPABILITIES);
        assert!(first.lookup_bool("Pipeline", false));
        let second = reader.next_message().unwrap().unwrap();
        assert_eq!(second.code, URI_START);
        assert!(reader.next_message().unwrap().is_none());
    }
}
