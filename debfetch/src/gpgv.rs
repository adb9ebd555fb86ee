//! Signature helper plumbing.
//!
//! Verification itself is done by the external `gpgv` binary. This module
//! builds its command line from the trusted keyrings, classifies the
//! `[GNUPG:]` status lines it prints, and splits clear-signed files into
//! their message and signature parts.
//!
//! # Example
//!
//! ```ignore
//! let gpgv = GpgvCommand::new("gpgv").with_trusted_parts("/etc/apt/trusted.gpg.d");
//! let outcome = gpgv.verify(Path::new("InRelease"), None)?;
//! outcome.verdict()?;
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config::GpgvConfig;
use crate::error::{AcquireError, AcquireResult};

const SIGNED_MESSAGE_START: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_START: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";
const STATUS_PREFIX: &str = "[GNUPG:] ";

// ============================================================================
// Clear-signed files
// ============================================================================

/// The parts of a clear-signed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearSigned {
    /// Message body, dash-escaping removed, lines joined without a trailing newline.
    pub content: String,
    /// The `Hash:` armor headers.
    pub headers: Vec<String>,
    /// Every signature block, each line newline-terminated.
    pub signature: String,
}

/// Split clear-signed text.
///
/// Returns `Ok(None)` when the input carries no signed message at all. A
/// signature block that is never closed, or a message missing one of its
/// parts, is an error.
pub fn split_clearsigned(input: &str) -> Result<Option<ClearSigned>, String> {
    let mut out = ClearSigned::default();
    let mut found_message_start = false;
    let mut found_message_end = false;
    let mut skip_until_empty_line = false;
    let mut found_signature = false;
    let mut first_line = true;

    for raw in input.lines() {
        let line = raw.trim_end();
        if !found_message_start {
            if line == SIGNED_MESSAGE_START {
                found_message_start = true;
                skip_until_empty_line = true;
            }
        } else if skip_until_empty_line {
            if line.is_empty() {
                skip_until_empty_line = false;
            } else if line.starts_with("Hash: ") {
                out.headers.push(line.to_string());
            }
        } else if !found_signature {
            if line == SIGNATURE_START {
                found_signature = true;
                found_message_end = true;
                out.signature.push_str(line);
                out.signature.push('\n');
            } else if !found_message_end {
                let dashfree = line.strip_prefix("- ").unwrap_or(line);
                if first_line {
                    first_line = false;
                } else {
                    out.content.push('\n');
                }
                out.content.push_str(dashfree);
            }
        } else {
            out.signature.push_str(line);
            out.signature.push('\n');
            if line == SIGNATURE_END {
                found_signature = false;
            }
        }
    }

    if found_signature {
        return Err("signature wasn't closed".to_string());
    }
    if first_line && !found_message_start && !found_message_end {
        return Ok(None);
    }
    if first_line || !found_message_start || !found_message_end {
        return Err(format!(
            "doesn't contain all expected parts (content: {}, start: {}, end: {})",
            !first_line, found_message_start, found_message_end
        ));
    }
    Ok(Some(out))
}

/// Split a clear-signed file, writing whichever parts are requested.
///
/// Returns `false` for an unsigned file.
pub fn split_clearsigned_file(
    input: &Path,
    content_out: Option<&Path>,
    signature_out: Option<&Path>,
) -> AcquireResult<bool> {
    let text = fs::read_to_string(input).map_err(|e| AcquireError::read(input, e))?;
    let split = split_clearsigned(&text).map_err(|reason| AcquireError::ClearSign {
        path: input.to_path_buf(),
        reason,
    })?;
    let Some(split) = split else {
        return Ok(false);
    };

    if let Some(path) = content_out {
        write_all(path, split.content.as_bytes())?;
    }
    if let Some(path) = signature_out {
        write_all(path, split.signature.as_bytes())?;
    }
    Ok(true)
}

fn write_all(path: &Path, data: &[u8]) -> AcquireResult<()> {
    let mut file = File::create(path).map_err(|e| AcquireError::write(path, e))?;
    file.write_all(data).map_err(|e| AcquireError::write(path, e))
}

/// Read a file's message text whether or not it is clear-signed.
pub fn open_maybe_clearsigned(path: &Path) -> AcquireResult<String> {
    let text = fs::read_to_string(path).map_err(|e| AcquireError::read(path, e))?;
    match split_clearsigned(&text) {
        Ok(Some(split)) => Ok(split.content),
        Ok(None) => Ok(text),
        Err(reason) => Err(AcquireError::ClearSign {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

/// Whether the first line marks a clear-signed message.
pub fn starts_clearsigned(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|t| t.lines().next().map(str::trim_end) == Some(SIGNED_MESSAGE_START))
        .unwrap_or(false)
}

// ============================================================================
// Status classification
// ============================================================================

/// Signers reported by one gpgv run, classified by status keyword.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpgvOutcome {
    pub good: Vec<String>,
    pub bad: Vec<String>,
    pub worthless: Vec<String>,
    pub no_pubkey: Vec<String>,
    pub exit_code: Option<i32>,
}

impl GpgvOutcome {
    /// Classify `[GNUPG:]` status lines.
    pub fn from_status(status: &str, exit_code: Option<i32>) -> Self {
        let mut outcome = Self {
            exit_code,
            ..Self::default()
        };

        for line in status.lines() {
            let Some(rest) = line.trim_end().strip_prefix(STATUS_PREFIX) else {
                continue;
            };
            let keyword = rest.split_whitespace().next().unwrap_or("");
            match keyword {
                "BADSIG" | "NODATA" => outcome.bad.push(rest.to_string()),
                "NO_PUBKEY" => outcome.no_pubkey.push(rest.to_string()),
                "KEYEXPIRED" | "REVKEYSIG" => outcome.worthless.push(rest.to_string()),
                "GOODSIG" => outcome.good.push(rest.to_string()),
                _ => {}
            }
        }
        outcome
    }

    /// Whether gpgv reported that the signature data itself is missing.
    pub fn no_data(&self) -> bool {
        self.bad.iter().any(|l| l.starts_with("NODATA"))
    }

    fn exit_message(&self) -> &'static str {
        match self.exit_code {
            Some(0) => "Internal error: Good signature, but could not determine key fingerprint?!",
            Some(1) => "At least one invalid signature was encountered.",
            Some(111) => "Could not execute 'gpgv' to verify signature (is gpgv installed?)",
            _ => "Unknown error executing gpgv",
        }
    }

    /// `Ok` when at least one good signature and no bad one was seen.
    ///
    /// Missing public keys alongside a good signature are not fatal. The
    /// error text lists the offending status lines.
    pub fn verdict(&self) -> Result<(), String> {
        if !self.good.is_empty() && self.bad.is_empty() {
            return Ok(());
        }

        if self.bad.is_empty() && self.worthless.is_empty() && self.no_pubkey.is_empty() {
            return Err(self.exit_message().to_string());
        }

        let mut message = String::new();
        if !self.bad.is_empty() {
            message.push_str("The following signatures were invalid:\n");
            for line in &self.bad {
                message.push_str(line);
                message.push('\n');
            }
        }
        if !self.worthless.is_empty() {
            message.push_str("The following signatures were invalid:\n");
            for line in &self.worthless {
                message.push_str(line);
                message.push('\n');
            }
        }
        if !self.no_pubkey.is_empty() {
            message.push_str(
                "The following signatures couldn't be verified because the public key is not available:\n",
            );
            for line in &self.no_pubkey {
                message.push_str(line);
                message.push('\n');
            }
        }
        Err(message)
    }

    /// Every classified line, for the `GPGVOutput` field of a Done message.
    pub fn output_lines(&self) -> Vec<String> {
        self.good
            .iter()
            .chain(&self.bad)
            .chain(&self.no_pubkey)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Command line
// ============================================================================

/// Builder for gpgv invocations.
#[derive(Debug, Clone)]
pub struct GpgvCommand {
    binary: PathBuf,
    trusted: Option<PathBuf>,
    trusted_parts: Option<PathBuf>,
    options: Vec<String>,
}

impl GpgvCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            trusted: None,
            trusted_parts: None,
            options: Vec::new(),
        }
    }

    pub fn from_config(config: &GpgvConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            trusted: config.trusted.clone(),
            trusted_parts: config.trusted_parts.clone(),
            options: config.options.clone(),
        }
    }

    pub fn with_trusted(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted = Some(path.into());
        self
    }

    pub fn with_trusted_parts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trusted_parts = Some(dir.into());
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// `*.gpg` files in the parts directory (sorted), then the trusted file.
    pub fn keyrings(&self) -> Vec<PathBuf> {
        let mut keyrings = Vec::new();
        if let Some(dir) = &self.trusted_parts {
            let pattern = format!("{}/*.gpg", dir.display());
            if let Ok(paths) = glob::glob(&pattern) {
                let mut parts: Vec<PathBuf> =
                    paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
                parts.sort();
                keyrings.extend(parts);
            }
        }
        if let Some(trusted) = &self.trusted {
            if trusted.is_file() {
                keyrings.push(trusted.clone());
            }
        }
        keyrings
    }

    /// Arguments after the binary name.
    ///
    /// `data` is `None` for a clear-signed file, which must then start with
    /// the signed-message marker.
    pub fn arguments(&self, signature: &Path, data: Option<&Path>) -> AcquireResult<Vec<String>> {
        let keyrings = self.keyrings();
        if keyrings.is_empty() {
            let dir = self
                .trusted_parts
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            return Err(AcquireError::Gpgv(format!("No keyring installed in {}.", dir)));
        }

        if data.is_none() && !starts_clearsigned(signature) {
            return Err(AcquireError::Gpgv(format!(
                "Clearsigned file '{}' isn't valid, got 'NOSPLIT' (does the network require authentication?)",
                signature.display()
            )));
        }

        let mut args = vec![
            "--ignore-time-conflict".to_string(),
            "--status-fd".to_string(),
            "1".to_string(),
        ];
        for keyring in keyrings {
            args.push("--keyring".to_string());
            args.push(keyring.display().to_string());
        }
        args.extend(self.options.iter().cloned());
        args.push(signature.display().to_string());
        if let Some(data) = data {
            args.push(data.display().to_string());
        }
        Ok(args)
    }

    /// Run gpgv and classify its status output.
    pub fn verify(&self, signature: &Path, data: Option<&Path>) -> AcquireResult<GpgvOutcome> {
        let args = self.arguments(signature, data)?;
        debug!(binary = %self.binary.display(), args = ?args, "running gpgv");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(output) => {
                let status = String::from_utf8_lossy(&output.stdout);
                debug!(stderr = %String::from_utf8_lossy(&output.stderr), "gpgv finished");
                Ok(GpgvOutcome::from_status(&status, output.status.code()))
            }
            Err(e) => {
                debug!(error = %e, "gpgv could not be executed");
                Ok(GpgvOutcome {
                    exit_code: Some(111),
                    ..GpgvOutcome::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SIGNED: &str = "-----BEGIN PGP SIGNED MESSAGE-----\n\
Hash: SHA512\n\
Comment: ignored\n\
\n\
Origin: Debian\n\
- Suite: sid\n\
-----BEGIN PGP SIGNATURE-----\n\
\n\
iQIzBAEBCgAdFiEE\n\
-----END PGP SIGNATURE-----\n";

    #[test]
    fn test_split_clearsigned() {
        let split = split_clearsigned(SIGNED).unwrap().unwrap();
        assert_eq!(split.content, "Origin: Debian\nSuite: sid");
        assert_eq!(split.headers, vec!["Hash: SHA512".to_string()]);
        assert!(split.signature.starts_with(SIGNATURE_START));
        assert!(split.signature.ends_with("-----END PGP SIGNATURE-----\n"));
    }

    #[test]
    fn test_split_unsigned_is_none() {
        assert_eq!(split_clearsigned("Origin: Debian\nSuite: sid\n"), Ok(None));
    }

    #[test]
    fn test_split_unclosed_signature_is_error() {
        let text = "-----BEGIN PGP SIGNED MESSAGE-----\n\nbody\n-----BEGIN PGP SIGNATURE-----\nabc\n";
        assert!(split_clearsigned(text).is_err());
    }

    #[test]
    fn test_split_missing_signature_is_error() {
        let text = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\nbody only\n";
        assert!(split_clearsigned(text).is_err());
    }

    #[test]
    fn test_split_keeps_multiple_signatures() {
        let text = format!("{}{}\niQ2\n{}\n", SIGNED, SIGNATURE_START, SIGNATURE_END);
        let split = split_clearsigned(&text).unwrap().unwrap();
        assert_eq!(split.signature.matches(SIGNATURE_START).count(), 2);
    }

    #[test]
    fn test_split_file_and_open() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("InRelease");
        let content = temp.path().join("content");
        let sig = temp.path().join("sig");
        fs::write(&input, SIGNED).unwrap();

        assert!(split_clearsigned_file(&input, Some(&content), Some(&sig)).unwrap());
        assert_eq!(fs::read_to_string(&content).unwrap(), "Origin: Debian\nSuite: sid");
        assert!(fs::read_to_string(&sig).unwrap().contains("iQIzBAEBCgAdFiEE"));
        assert_eq!(
            open_maybe_clearsigned(&input).unwrap(),
            "Origin: Debian\nSuite: sid"
        );

        let plain = temp.path().join("Release");
        fs::write(&plain, "Suite: sid\n").unwrap();
        assert!(!split_clearsigned_file(&plain, None, None).unwrap());
        assert_eq!(open_maybe_clearsigned(&plain).unwrap(), "Suite: sid\n");
    }

    #[test]
    fn test_outcome_good_with_missing_key_is_ok() {
        let status = "[GNUPG:] NEWSIG\n[GNUPG:] GOODSIG AAAA Debian\n[GNUPG:] NO_PUBKEY BBBB\n";
        let outcome = GpgvOutcome::from_status(status, Some(2));
        assert_eq!(outcome.good, vec!["GOODSIG AAAA Debian"]);
        assert_eq!(outcome.no_pubkey, vec!["NO_PUBKEY BBBB"]);
        assert!(outcome.verdict().is_ok());
        assert_eq!(outcome.output_lines().len(), 2);
    }

    #[test]
    fn test_outcome_bad_signature_is_fatal() {
        let outcome =
            GpgvOutcome::from_status("[GNUPG:] GOODSIG A x\n[GNUPG:] BADSIG B y\n", Some(1));
        let err = outcome.verdict().unwrap_err();
        assert!(err.contains("The following signatures were invalid"));
        assert!(err.contains("BADSIG B y"));
    }

    #[test]
    fn test_outcome_nodata() {
        let outcome = GpgvOutcome::from_status("[GNUPG:] NODATA 1\n", Some(2));
        assert!(outcome.no_data());
        assert!(outcome.verdict().unwrap_err().contains("NODATA 1"));
    }

    #[test]
    fn test_outcome_without_status_uses_exit_code() {
        let outcome = GpgvOutcome::from_status("", Some(111));
        assert_eq!(
            outcome.verdict().unwrap_err(),
            "Could not execute 'gpgv' to verify signature (is gpgv installed?)"
        );
    }

    #[test]
    fn test_arguments_need_keyrings() {
        let temp = TempDir::new().unwrap();
        let cmd = GpgvCommand::new("gpgv").with_trusted_parts(temp.path().join("parts"));
        let sig = temp.path().join("Release.gpg");
        fs::write(&sig, "sig").unwrap();
        assert!(matches!(
            cmd.arguments(&sig, Some(&sig)),
            Err(AcquireError::Gpgv(_))
        ));
    }

    #[test]
    fn test_arguments_order() {
        let temp = TempDir::new().unwrap();
        let parts = temp.path().join("trusted.gpg.d");
        fs::create_dir(&parts).unwrap();
        fs::write(parts.join("b.gpg"), "k").unwrap();
        fs::write(parts.join("a.gpg"), "k").unwrap();
        fs::write(parts.join("ignored.asc"), "k").unwrap();
        let trusted = temp.path().join("trusted.gpg");
        fs::write(&trusted, "k").unwrap();

        let cmd = GpgvCommand::new("gpgv")
            .with_trusted(&trusted)
            .with_trusted_parts(&parts)
            .with_option("--weak-digest")
            .with_option("sha1");
        let sig = temp.path().join("Release.gpg");
        let data = temp.path().join("Release");
        let args = cmd.arguments(&sig, Some(&data)).unwrap();

        assert_eq!(&args[..3], &["--ignore-time-conflict", "--status-fd", "1"]);
        assert_eq!(args[4], parts.join("a.gpg").display().to_string());
        assert_eq!(args[6], parts.join("b.gpg").display().to_string());
        assert_eq!(args[8], trusted.display().to_string());
        assert_eq!(args[9], "--weak-digest");
        assert_eq!(args[args.len() - 2], sig.display().to_string());
        assert_eq!(args[args.len() - 1], data.display().to_string());
    }

    #[test]
    fn test_clearsigned_arguments_require_marker() {
        let temp = TempDir::new().unwrap();
        let trusted = temp.path().join("trusted.gpg");
        fs::write(&trusted, "k").unwrap();
        let cmd = GpgvCommand::new("gpgv").with_trusted(&trusted);

        let portal = temp.path().join("InRelease");
        fs::write(&portal, "<html>login</html>\n").unwrap();
        assert!(cmd.arguments(&portal, None).is_err());

        fs::write(&portal, SIGNED).unwrap();
        let args = cmd.arguments(&portal, None).unwrap();
        assert_eq!(args.last().unwrap(), &portal.display().to_string());
    }
}
