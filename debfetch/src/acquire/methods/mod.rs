//! Built-in transports and the runner for external method binaries.
//!
//! In-process transports implement [`Method`] and run on a dedicated
//! thread each, one request at a time:
//!
//! ```text
//!   engine ──600──► ThreadTransport ──mpsc──► thread: Method::fetch ──201/400──► EventSink
//! ```
//!
//! Schemes without a built-in transport are looked up as executables under
//! `methods_dir` and spoken to over stdin/stdout ([`process`]).

mod copy;
mod decompress;
mod file;
mod gpgv;
mod http;
pub mod process;
mod rred;

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AcquireConfig;
use crate::error::{AcquireError, AcquireResult};
use crate::hashes::Hashes;
use crate::message::{self, Message};
use crate::uri::{parse_rfc1123, time_rfc1123, Uri};

use super::{EventSink, MethodConfig, Transport, TransportFactory};

pub use copy::CopyMethod;
pub use decompress::DecompressMethod;
pub use file::FileMethod;
pub use gpgv::GpgvMethod;
pub use http::HttpMethod;
pub use process::MethodProcess;
pub use rred::RredMethod;

/// Version string the built-in transports announce.
pub const METHOD_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Requests and replies
// =============================================================================

/// A decoded `600 URI Acquire` request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub uri: String,
    /// Path part of the URI, the source file for local transports.
    pub path: PathBuf,
    /// Where the result must be written.
    pub filename: PathBuf,
    /// Modification time of the copy the engine already has.
    pub last_modified: Option<SystemTime>,
    /// The full request, for transport-specific fields.
    pub message: Message,
}

impl FetchRequest {
    pub fn from_message(msg: &Message) -> Result<Self, String> {
        let uri = msg.get("URI");
        if uri.is_empty() {
            return Err("request without URI".to_string());
        }
        let parsed = Uri::parse(uri).map_err(|e| e.to_string())?;
        Ok(Self {
            uri: uri.to_string(),
            path: PathBuf::from(&parsed.path),
            filename: PathBuf::from(msg.get("Filename")),
            last_modified: msg.lookup("Last-Modified").and_then(parse_rfc1123),
            message: msg.clone(),
        })
    }

    /// `200 URI Start` for this request.
    pub fn started(&self, size: u64, resume_point: u64) -> Message {
        let mut msg = Message::new(message::URI_START, "URI Start").with("URI", &self.uri);
        if size > 0 {
            msg.set("Size", size.to_string());
        }
        if resume_point > 0 {
            msg.set("Resume-Point", resume_point.to_string());
        }
        msg
    }

    /// `201 URI Done` for a result file, with its size, mtime and digests.
    pub fn done(&self, result: &Path) -> Result<Message, String> {
        let meta = fs::metadata(result).map_err(|e| format!("{}: {}", result.display(), e))?;
        let hashes = Hashes::from_file(result).map_err(|e| e.to_string())?;

        let mut msg = Message::new(message::URI_DONE, "URI Done")
            .with("URI", &self.uri)
            .with("Filename", result.display().to_string())
            .with("Size", meta.len().to_string());
        if let Ok(modified) = meta.modified() {
            msg.set("Last-Modified", time_rfc1123(modified));
        }
        for (field, value) in hashes.message_fields() {
            msg.set(field, value);
        }
        Ok(msg)
    }

    /// `201 URI Done` telling the engine its copy is current.
    pub fn ims_hit(&self) -> Message {
        Message::new(message::URI_DONE, "URI Done")
            .with("URI", &self.uri)
            .with("Filename", self.filename.display().to_string())
            .with("IMS-Hit", "true")
    }

    /// `400 URI Failure`.
    pub fn failure(&self, text: impl Into<String>) -> Message {
        Message::new(message::URI_FAILURE, "URI Failure")
            .with("URI", &self.uri)
            .with("Message", text)
    }

    /// `400 URI Failure` worth retrying.
    pub fn transient_failure(&self, text: impl Into<String>, reason: &str) -> Message {
        self.failure(text)
            .with("FailReason", reason)
            .with("Transient-Failure", "true")
    }

    /// Whether `path` is unchanged since the engine's copy was written.
    pub fn not_modified(&self, path: &Path) -> bool {
        let Some(since) = self.last_modified else {
            return false;
        };
        let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
            return false;
        };
        // second precision on the wire
        time_rfc1123(since) == time_rfc1123(modified)
    }
}

/// An in-process transport.
pub trait Method: Send + 'static {
    /// What to announce in `100 Capabilities`.
    fn config(&self) -> MethodConfig;

    /// Handle a `601 Configuration` message.
    fn configure(&mut self, _msg: &Message) {}

    /// Serve one request, returning the final `201` or `400` reply.
    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message;
}

// =============================================================================
// Thread runner
// =============================================================================

/// Runs a [`Method`] on its own thread.
pub struct ThreadTransport {
    tx: Option<mpsc::UnboundedSender<Message>>,
    handle: Option<JoinHandle<()>>,
    access: String,
}

impl ThreadTransport {
    pub fn spawn<M: Method>(mut method: M, sink: EventSink) -> AcquireResult<Self> {
        let access = method.config().access;
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let handle = thread::Builder::new()
            .name(format!("method-{}", access))
            .spawn(move || {
                if !sink.send(method.config().to_message()) {
                    return;
                }
                while let Some(msg) = rx.blocking_recv() {
                    let reply = match msg.code {
                        message::CONFIGURATION => {
                            method.configure(&msg);
                            continue;
                        }
                        message::URI_ACQUIRE => match FetchRequest::from_message(&msg) {
                            Ok(request) => method.fetch(&request, &sink),
                            Err(e) => Message::new(message::GENERAL_FAILURE, "General Failure")
                                .with("Message", e),
                        },
                        other => {
                            debug!(code = other, "method ignoring message");
                            continue;
                        }
                    };
                    if !sink.send(reply) {
                        break;
                    }
                }
            })
            .map_err(|e| AcquireError::WorkerSpawn {
                access: access.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            access,
        })
    }
}

impl Transport for ThreadTransport {
    fn send(&mut self, message: Message) -> AcquireResult<()> {
        let sent = self.tx.as_ref().map(|tx| tx.send(message).is_ok());
        match sent {
            Some(true) => Ok(()),
            _ => Err(AcquireError::Protocol {
                access: self.access.clone(),
                reason: "method thread has stopped".to_string(),
            }),
        }
    }

    fn shutdown(&mut self) {
        // the thread exits after its current request
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ThreadTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Default factory
// =============================================================================

/// Built-in transports, falling back to method binaries under `methods_dir`.
#[derive(Debug, Default, Clone)]
pub struct DefaultTransports;

impl DefaultTransports {
    pub fn new() -> Self {
        Self
    }

    fn external_binary(access: &str, config: &AcquireConfig) -> Option<PathBuf> {
        let path = config.methods_dir.join(access);
        path.is_file().then_some(path)
    }
}

impl TransportFactory for DefaultTransports {
    fn spawn(
        &self,
        access: &str,
        config: &AcquireConfig,
        sink: EventSink,
    ) -> AcquireResult<Box<dyn Transport>> {
        debug!(access, worker = %sink.worker(), "starting transport");
        let transport: Box<dyn Transport> = match access {
            "file" => Box::new(ThreadTransport::spawn(FileMethod, sink)?),
            "copy" => Box::new(ThreadTransport::spawn(CopyMethod, sink)?),
            "rred" => Box::new(ThreadTransport::spawn(RredMethod, sink)?),
            "gpgv" => Box::new(ThreadTransport::spawn(GpgvMethod::new(config), sink)?),
            "http" | "https" => Box::new(ThreadTransport::spawn(HttpMethod::new(access, config)?, sink)?),
            _ => {
                if let Some(compressor) = config.compressor_for_method(access) {
                    Box::new(ThreadTransport::spawn(DecompressMethod::new(compressor), sink)?)
                } else if let Some(binary) = Self::external_binary(access, config) {
                    Box::new(MethodProcess::spawn(access, &binary, sink)?)
                } else {
                    warn!(access, "no transport available");
                    return Err(AcquireError::NoTransport(access.to_string()));
                }
            }
        };
        Ok(transport)
    }

    fn capabilities(&self, access: &str, config: &AcquireConfig) -> Option<MethodConfig> {
        match access {
            "file" => Some(FileMethod.config()),
            "copy" => Some(CopyMethod.config()),
            "rred" => Some(RredMethod.config()),
            "gpgv" => Some(gpgv::capabilities()),
            "http" | "https" => Some(http::capabilities(access)),
            _ => config
                .compressor_for_method(access)
                .map(|c| DecompressMethod::new(c).config()),
        }
    }
}

/// Capabilities shared by the local built-in transports.
pub(crate) fn local_capabilities(access: &str) -> MethodConfig {
    let mut cnf = MethodConfig::new(access);
    cnf.version = METHOD_VERSION.to_string();
    cnf.single_instance = true;
    cnf.local_only = true;
    cnf.pipeline = true;
    cnf
}
