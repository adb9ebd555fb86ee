//! The contract between the engine and transport workers.
//!
//! A transport receives `600 URI Acquire` and `601 Configuration` messages
//! through [`Transport::send`] and answers asynchronously through its
//! [`EventSink`]. The first message it sends must be `100 Capabilities`.

use std::fmt;

use tokio::sync::mpsc;

use crate::config::AcquireConfig;
use crate::error::AcquireResult;
use crate::message::Message;

use super::MethodConfig;

/// Identity of one running worker. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Something a worker reported.
#[derive(Debug)]
pub enum WorkerEvent {
    Message { worker: WorkerId, message: Message },
    /// The transport stopped on its own.
    Closed { worker: WorkerId, reason: String },
}

/// Where a transport delivers its replies.
#[derive(Debug, Clone)]
pub struct EventSink {
    worker: WorkerId,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub fn new(worker: WorkerId, tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { worker, tx }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Deliver a message. Returns false once the engine is gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx
            .send(WorkerEvent::Message {
                worker: self.worker,
                message,
            })
            .is_ok()
    }

    /// Report that the transport ended unexpectedly.
    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(WorkerEvent::Closed {
            worker: self.worker,
            reason: reason.into(),
        });
    }
}

/// The engine side of a running transport.
pub trait Transport: Send {
    /// Hand a request to the transport. Must not block on the transfer.
    fn send(&mut self, message: Message) -> AcquireResult<()>;

    /// Stop the transport. Replies still in flight are discarded.
    fn shutdown(&mut self) {}
}

/// Starts transports by scheme.
pub trait TransportFactory: Send + Sync {
    /// Start a transport for `access`, replying through `sink`.
    fn spawn(
        &self,
        access: &str,
        config: &AcquireConfig,
        sink: EventSink,
    ) -> AcquireResult<Box<dyn Transport>>;

    /// Capabilities known before the transport runs, used to pick queues.
    fn capabilities(&self, _access: &str, _config: &AcquireConfig) -> Option<MethodConfig> {
        None
    }
}
