//! `gpgv:` pivots: verify a signature with the external helper.
//!
//! The URI names the signature. A clear-signed file carries its own data;
//! a detached signature covers the requested file name.

use std::path::Path;

use tracing::{debug, info};

use crate::acquire::{EventSink, MethodConfig};
use crate::config::AcquireConfig;
use crate::gpgv::GpgvCommand;
use crate::message::Message;

use super::{local_capabilities, FetchRequest, Method};

pub(super) fn capabilities() -> MethodConfig {
    local_capabilities("gpgv")
}

#[derive(Debug, Clone)]
pub struct GpgvMethod {
    command: GpgvCommand,
}

impl GpgvMethod {
    pub fn new(config: &AcquireConfig) -> Self {
        Self {
            command: GpgvCommand::from_config(&config.gpgv),
        }
    }

    pub fn with_command(command: GpgvCommand) -> Self {
        Self { command }
    }
}

impl Method for GpgvMethod {
    fn config(&self) -> MethodConfig {
        capabilities()
    }

    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message {
        let signature = request.path.as_path();
        let data: Option<&Path> = (request.filename != signature).then_some(request.filename.as_path());
        sink.send(request.started(0, 0));

        let outcome = match self.command.verify(signature, data) {
            Ok(outcome) => outcome,
            Err(e) => return request.failure(e.to_string()),
        };
        debug!(signature = %signature.display(), outcome = ?outcome, "gpgv finished");

        if let Err(reason) = outcome.verdict() {
            return request.failure(reason);
        }
        info!(signature = %signature.display(), signers = outcome.good.len(), "good signature");

        Message::new(crate::message::URI_DONE, "URI Done")
            .with("URI", &request.uri)
            .with("Filename", request.filename.display().to_string())
            .with("GPGVOutput", outcome.output_lines().join("\n"))
    }
}
