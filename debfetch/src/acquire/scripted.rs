//! In-memory transports with canned replies, for driving the engine in tests.
//!
//! Remote schemes (`http`, `https`, `ftp`) and any scheme with a scripted
//! reply are answered from the script; everything else (`copy`, `gzip`,
//! `rred`, ...) goes to the built-in transports, so a scripted run still
//! decompresses and patches for real.
//!
//! ```ignore
//! let transports = ScriptedTransports::new()
//!     .with_content("http://deb.example.org/debian/dists/sid/Release", release)
//!     .with_scheme_reply("gpgv", Reply::verified());
//! let mut acquire = Acquire::new(config, Arc::new(transports.clone()))?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::AcquireConfig;
use crate::error::AcquireResult;
use crate::message::{self, Message};
use crate::uri::Uri;

use super::methods::{local_capabilities, DefaultTransports, FetchRequest};
use super::{EventSink, MethodConfig, Transport, TransportFactory};

const REMOTE_SCHEMES: [&str; 3] = ["http", "https", "ftp"];

/// A canned answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Write these bytes to the requested file and report success.
    Content(Vec<u8>),
    /// Report the engine's copy as current.
    NotModified,
    /// Report a failure.
    Failure {
        message: String,
        reason: String,
        transient: bool,
    },
    /// Report a good signature on the requested file.
    Verified(String),
    /// Never answer.
    Silent,
}

impl Reply {
    pub fn content(data: impl Into<Vec<u8>>) -> Self {
        Reply::Content(data.into())
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Reply::Failure {
            message: message.into(),
            reason: String::new(),
            transient: false,
        }
    }

    /// A failure with a `FailReason` and `Transient-Failure: true`.
    pub fn transient(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Reply::Failure {
            message: message.into(),
            reason: reason.into(),
            transient: true,
        }
    }

    pub fn verified() -> Self {
        Reply::Verified("GOODSIG 0123456789ABCDEF Archive Automatic Signing Key".to_string())
    }
}

#[derive(Debug, Default)]
struct Script {
    /// Per URI; the last reply repeats.
    replies: HashMap<String, VecDeque<Reply>>,
    /// Per scheme, for URIs without their own reply.
    scheme_replies: HashMap<String, Reply>,
    requests: Vec<String>,
}

impl Script {
    fn next_reply(&mut self, uri: &str) -> Option<Reply> {
        if let Some(replies) = self.replies.get_mut(uri) {
            let reply = if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            };
            if reply.is_some() {
                return reply;
            }
        }
        self.scheme_replies.get(Uri::access_of(uri)).cloned()
    }
}

/// A [`TransportFactory`] answering from a script. Clones share the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransports {
    script: Arc<Mutex<Script>>,
    builtin: DefaultTransports,
}

impl ScriptedTransports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `uri` with `reply`. Several replies for one URI are used in order.
    pub fn with_reply(self, uri: impl Into<String>, reply: Reply) -> Self {
        self.script
            .lock()
            .replies
            .entry(uri.into())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_content(self, uri: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.with_reply(uri, Reply::content(data))
    }

    /// Answer every otherwise unscripted URI of `access` with `reply`.
    pub fn with_scheme_reply(self, access: impl Into<String>, reply: Reply) -> Self {
        self.script.lock().scheme_replies.insert(access.into(), reply);
        self
    }

    /// URIs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.script.lock().requests.clone()
    }

    /// How many requests started with `prefix`.
    pub fn request_count(&self, prefix: &str) -> usize {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|u| u.starts_with(prefix))
            .count()
    }

    fn serves(&self, access: &str) -> bool {
        if REMOTE_SCHEMES.contains(&access) {
            return true;
        }
        let script = self.script.lock();
        script.scheme_replies.contains_key(access)
            || script.replies.keys().any(|uri| Uri::access_of(uri) == access)
    }

    fn scripted_capabilities(access: &str) -> MethodConfig {
        if REMOTE_SCHEMES.contains(&access) {
            let mut cnf = MethodConfig::new(access);
            cnf.pipeline = true;
            cnf
        } else {
            local_capabilities(access)
        }
    }
}

impl TransportFactory for ScriptedTransports {
    fn spawn(
        &self,
        access: &str,
        config: &AcquireConfig,
        sink: EventSink,
    ) -> AcquireResult<Box<dyn Transport>> {
        if !self.serves(access) {
            return self.builtin.spawn(access, config, sink);
        }
        let transport = ScriptedTransport {
            script: Arc::clone(&self.script),
            sink,
        };
        transport
            .sink
            .send(Self::scripted_capabilities(access).to_message());
        Ok(Box::new(transport))
    }

    fn capabilities(&self, access: &str, config: &AcquireConfig) -> Option<MethodConfig> {
        if self.serves(access) {
            Some(Self::scripted_capabilities(access))
        } else {
            self.builtin.capabilities(access, config)
        }
    }
}

/// Answers synchronously from inside `send`.
struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    sink: EventSink,
}

impl ScriptedTransport {
    fn answer(&self, request: &FetchRequest) -> Option<Message> {
        let reply = {
            let mut script = self.script.lock();
            script.requests.push(request.uri.clone());
            script.next_reply(&request.uri)
        };
        debug!(uri = %request.uri, scripted = reply.is_some(), "scripted reply");

        let msg = match reply {
            None => request
                .failure("404  Not Found")
                .with("FailReason", "HttpError404"),
            Some(Reply::Silent) => return None,
            Some(Reply::NotModified) => request.ims_hit(),
            Some(Reply::Failure {
                message,
                reason,
                transient,
            }) => {
                let mut msg = request.failure(message).with("FailReason", reason);
                if transient {
                    msg.set("Transient-Failure", "true");
                }
                msg
            }
            Some(Reply::Verified(output)) => Message::new(message::URI_DONE, "URI Done")
                .with("URI", &request.uri)
                .with("Filename", request.filename.display().to_string())
                .with("GPGVOutput", output),
            Some(Reply::Content(data)) => {
                self.sink.send(request.started(data.len() as u64, 0));
                match fs::write(&request.filename, &data) {
                    Ok(()) => request.done(&request.filename).unwrap_or_else(|e| request.failure(e)),
                    Err(e) => request.failure(format!("{}: {}", request.filename.display(), e)),
                }
            }
        };
        Some(msg)
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, msg: Message) -> AcquireResult<()> {
        if msg.code != message::URI_ACQUIRE {
            return Ok(());
        }
        let reply = match FetchRequest::from_message(&msg) {
            Ok(request) => self.answer(&request),
            Err(e) => Some(Message::new(message::GENERAL_FAILURE, "General Failure").with("Message", e)),
        };
        if let Some(reply) = reply {
            self.sink.send(reply);
        }
        Ok(())
    }
}
