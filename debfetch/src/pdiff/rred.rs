//! ed-script patch application.
//!
//! Diff files produced by `diff --ed` address lines from the end of the file
//! towards the start, so commands can be replayed against the buffer in
//! order. Supported commands: `Na`, `N[,M]c`, `N[,M]d`, the `s/.//` escape
//! for text lines consisting of a single dot, and a bare `a` after it.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use thiserror::Error;

/// Errors from patching.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("failed to access {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    #[error("patch line {line}: unknown command {text:?}")]
    BadCommand { line: usize, text: String },

    #[error("patch line {line}: address out of range in {text:?}")]
    OutOfRange { line: usize, text: String },

    #[error("patch ends inside a text block")]
    Unterminated,
}

enum Command {
    Append(usize),
    Change(usize, usize),
    Delete(usize, usize),
    StripDot,
    AppendCurrent,
}

fn parse_command(text: &[u8], line: usize) -> Result<Command, PatchError> {
    let bad = || PatchError::BadCommand {
        line,
        text: String::from_utf8_lossy(text).into_owned(),
    };

    if text == b"s/.//" {
        return Ok(Command::StripDot);
    }
    if text == b"a" {
        return Ok(Command::AppendCurrent);
    }

    let (&op, range) = text.split_last().ok_or_else(bad)?;
    let range = std::str::from_utf8(range).map_err(|_| bad())?;
    let (start, end) = match range.split_once(',') {
        Some((a, b)) => (a.parse().map_err(|_| bad())?, b.parse().map_err(|_| bad())?),
        None => {
            let n: usize = range.parse().map_err(|_| bad())?;
            (n, n)
        }
    };

    match op {
        b'a' if start == end => Ok(Command::Append(start)),
        b'c' => Ok(Command::Change(start, end)),
        b'd' => Ok(Command::Delete(start, end)),
        _ => Err(bad()),
    }
}

/// Apply one ed script to a buffer of lines.
pub fn apply_ed_script(lines: &mut Vec<Vec<u8>>, script: &[u8]) -> Result<(), PatchError> {
    let mut script_lines = script.split(|&b| b == b'\n').enumerate().peekable();
    let mut current = 0usize;

    while let Some((idx, raw)) = script_lines.next() {
        let line_no = idx + 1;
        if raw.is_empty() && script_lines.peek().is_none() {
            break;
        }

        let command = parse_command(raw, line_no)?;
        let out_of_range = || PatchError::OutOfRange {
            line: line_no,
            text: String::from_utf8_lossy(raw).into_owned(),
        };

        let mut read_text = || -> Result<Vec<Vec<u8>>, PatchError> {
            let mut text = Vec::new();
            loop {
                let Some((_, line)) = script_lines.next() else {
                    return Err(PatchError::Unterminated);
                };
                if line == b"." {
                    return Ok(text);
                }
                text.push(line.to_vec());
            }
        };

        match command {
            Command::Append(after) => {
                if after > lines.len() {
                    return Err(out_of_range());
                }
                let text = read_text()?;
                current = after + text.len();
                lines.splice(after..after, text);
            }
            Command::AppendCurrent => {
                let text = read_text()?;
                let after = current.min(lines.len());
                current = after + text.len();
                lines.splice(after..after, text);
            }
            Command::Change(start, end) => {
                if start == 0 || start > end || end > lines.len() {
                    return Err(out_of_range());
                }
                let text = read_text()?;
                current = start - 1 + text.len();
                lines.splice(start - 1..end, text);
            }
            Command::Delete(start, end) => {
                if start == 0 || start > end || end > lines.len() {
                    return Err(out_of_range());
                }
                lines.drain(start - 1..end);
                current = start.min(lines.len());
            }
            Command::StripDot => {
                if current == 0 || current > lines.len() {
                    return Err(out_of_range());
                }
                let line = &mut lines[current - 1];
                if !line.is_empty() {
                    line.remove(0);
                }
            }
        }
    }
    Ok(())
}

/// Read a patch file, gunzipping it when it carries the gzip magic.
fn read_patch(path: &Path) -> Result<Vec<u8>, PatchError> {
    let io_err = |e: std::io::Error| PatchError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let raw = fs::read(path).map_err(io_err)?;
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        MultiGzDecoder::new(&raw[..])
            .read_to_end(&mut out)
            .map_err(io_err)?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

/// Apply `patches` in order to `base`, writing the result to `output`.
pub fn apply_ed_patches(base: &Path, patches: &[PathBuf], output: &Path) -> Result<(), PatchError> {
    let data = fs::read(base).map_err(|e| PatchError::Io {
        path: base.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut lines: Vec<Vec<u8>> = data.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
    if lines.last().is_some_and(Vec::is_empty) {
        lines.pop();
    }

    for patch in patches {
        let script = read_patch(patch)?;
        apply_ed_script(&mut lines, &script)?;
    }

    let write_err = |e: std::io::Error| PatchError::Io {
        path: output.to_path_buf(),
        reason: e.to_string(),
    };
    let file = File::create(output).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    for line in &lines {
        writer.write_all(line).map_err(write_err)?;
        writer.write_all(b"\n").map_err(write_err)?;
    }
    writer.flush().map_err(write_err)
}
