//! Decompression pivots (`gzip:`, `xz:`, ...).
//!
//! gzip is decoded in-process; every other format is piped through the
//! configured helper binary.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::process::{Command, Stdio};

use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::acquire::{EventSink, MethodConfig};
use crate::config::Compressor;
use crate::message::Message;

use super::{local_capabilities, FetchRequest, Method};

#[derive(Debug, Clone)]
pub struct DecompressMethod {
    compressor: Compressor,
}

impl DecompressMethod {
    pub fn new(compressor: &Compressor) -> Self {
        Self {
            compressor: compressor.clone(),
        }
    }

    fn in_process(&self) -> bool {
        self.compressor.binary == "gzip"
    }

    fn gunzip(&self, request: &FetchRequest) -> Result<(), String> {
        let input = File::open(&request.path).map_err(|e| format!("{}: {}", request.path.display(), e))?;
        let output = File::create(&request.filename)
            .map_err(|e| format!("{}: {}", request.filename.display(), e))?;
        let mut writer = BufWriter::new(output);
        io::copy(&mut MultiGzDecoder::new(input), &mut writer)
            .map_err(|e| format!("Error reading from {}: {}", request.path.display(), e))?;
        writer.flush().map_err(|e| e.to_string())
    }

    fn run_helper(&self, request: &FetchRequest) -> Result<(), String> {
        let input = File::open(&request.path).map_err(|e| format!("{}: {}", request.path.display(), e))?;
        let output = File::create(&request.filename)
            .map_err(|e| format!("{}: {}", request.filename.display(), e))?;

        debug!(binary = %self.compressor.binary, args = ?self.compressor.args, "running decompressor");
        let status = Command::new(&self.compressor.binary)
            .args(&self.compressor.args)
            .stdin(Stdio::from(input))
            .stdout(Stdio::from(output))
            .status()
            .map_err(|e| format!("Couldn't execute {}: {}", self.compressor.binary, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!("{} returned an error code ({})", self.compressor.binary, status))
        }
    }
}

impl Method for DecompressMethod {
    fn config(&self) -> MethodConfig {
        local_capabilities(&self.compressor.method)
    }

    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message {
        let size = request.path.metadata().map(|m| m.len()).unwrap_or(0);
        sink.send(request.started(size, 0));

        let result = if self.in_process() {
            self.gunzip(request)
        } else {
            self.run_helper(request)
        };
        if let Err(e) = result {
            crate::item::remove_quietly(&request.filename);
            return request.failure(e);
        }
        request
            .done(&request.filename)
            .unwrap_or_else(|e| request.failure(e))
    }
}
