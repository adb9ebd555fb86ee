//! The acquire engine: queues, workers and the run loop.
//!
//! ```text
//!                 ┌─────────────────────── Acquire ───────────────────────┐
//!   ItemSpec ───► │  ItemArena ──Enqueue──► Queue "http:deb.example.org"  │
//!                 │      ▲                        │ 600 URI Acquire       │
//!                 │      │ done/failed            ▼                       │
//!                 │  handle_event ◄── mpsc ◄── Worker ◄──► Transport      │
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! Every state change happens on the task running [`Acquire::run`]. Workers
//! push [`WorkerEvent`]s into a single channel; transports run their I/O on
//! their own threads or processes and never touch items.

mod engine;
mod method;
pub mod methods;
mod queue;
pub mod scripted;
mod status;

pub use engine::{Acquire, FailedItem, RunResult, RunSummary};
pub use method::{EventSink, Transport, TransportFactory, WorkerEvent, WorkerId};
pub use methods::DefaultTransports;
pub use queue::{Queue, QueueEntry};
pub use scripted::{Reply, ScriptedTransports};
pub use status::{AcquireStatus, CountingStatus, NoStatus, ProgressSnapshot};

use crate::message::Message;

/// Capabilities a transport announces in its `100 Capabilities` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodConfig {
    /// Scheme the transport serves.
    pub access: String,
    pub version: String,
    /// One worker serves every host of the scheme.
    pub single_instance: bool,
    /// Several requests may be outstanding at once.
    pub pipeline: bool,
    /// Wants a `601 Configuration` message before the first request.
    pub send_config: bool,
    /// Never touches the network.
    pub local_only: bool,
    pub needs_cleanup: bool,
    /// Serves removable media.
    pub removable: bool,
}

impl MethodConfig {
    /// Conservative defaults for a transport that has not reported yet.
    pub fn new(access: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            version: String::new(),
            single_instance: false,
            pipeline: false,
            send_config: false,
            local_only: false,
            needs_cleanup: false,
            removable: false,
        }
    }

    /// Read a `100 Capabilities` message.
    pub fn from_capabilities(access: impl Into<String>, msg: &Message) -> Self {
        Self {
            access: access.into(),
            version: msg.get("Version").to_string(),
            single_instance: msg.lookup_bool("Single-Instance", false),
            pipeline: msg.lookup_bool("Pipeline", false),
            send_config: msg.lookup_bool("Send-Config", false),
            local_only: msg.lookup_bool("Local-Only", false),
            needs_cleanup: msg.lookup_bool("Needs-Cleanup", false),
            removable: msg.lookup_bool("Removable", false),
        }
    }

    /// The `100 Capabilities` message announcing this configuration.
    pub fn to_message(&self) -> Message {
        let flag = |on: bool| if on { "true" } else { "false" };
        Message::new(crate::message::CAPABILITIES, "Capabilities")
            .with("Version", &self.version)
            .with("Single-Instance", flag(self.single_instance))
            .with("Pipeline", flag(self.pipeline))
            .with("Send-Config", flag(self.send_config))
            .with("Local-Only", flag(self.local_only))
            .with("Needs-Cleanup", flag(self.needs_cleanup))
            .with("Removable", flag(self.removable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CAPABILITIES;

    #[test]
    fn test_from_capabilities() {
        let msg = Message::new(CAPABILITIES, "Capabilities")
            .with("Version", "1.2")
            .with("Single-Instance", "true")
            .with("Pipeline", "yes")
            .with("Local-Only", "false");
        let cnf = MethodConfig::from_capabilities("file", &msg);
        assert_eq!(cnf.access, "file");
        assert_eq!(cnf.version, "1.2");
        assert!(cnf.single_instance);
        assert!(cnf.pipeline);
        assert!(!cnf.local_only);
        assert!(!cnf.send_config);
    }

    #[test]
    fn test_capabilities_message_reads_back() {
        let mut cnf = MethodConfig::new("rred");
        cnf.local_only = true;
        cnf.single_instance = true;
        let back = MethodConfig::from_capabilities("rred", &cnf.to_message());
        assert_eq!(back, cnf);
    }
}
