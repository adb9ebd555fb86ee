//! External method binaries speaking the message protocol on stdin/stdout.

use std::io::{BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use crate::acquire::{EventSink, Transport};
use crate::error::{AcquireError, AcquireResult};
use crate::message::{Message, MessageReader};

/// A running method binary.
pub struct MethodProcess {
    access: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl MethodProcess {
    /// Start `binary` and forward every message it prints to `sink`.
    pub fn spawn(access: &str, binary: &Path, sink: EventSink) -> AcquireResult<Self> {
        let spawn_err = |reason: String| AcquireError::WorkerSpawn {
            access: access.to_string(),
            reason,
        };

        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {}", binary.display(), e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("no stdout pipe".to_string()))?;

        let name = access.to_string();
        thread::Builder::new()
            .name(format!("method-{}-reader", access))
            .spawn(move || {
                let mut reader = MessageReader::new(BufReader::new(stdout));
                loop {
                    match reader.next_message() {
                        Ok(Some(message)) => {
                            if !sink.send(message) {
                                return;
                            }
                        }
                        Ok(None) => {
                            sink.closed(format!("Method {} has died unexpectedly!", name));
                            return;
                        }
                        Err(e) => {
                            warn!(access = %name, error = %e, "unreadable message from method");
                            sink.closed(format!("Method {} sent a malformed message: {}", name, e));
                            return;
                        }
                    }
                }
            })
            .map_err(|e| spawn_err(e.to_string()))?;

        debug!(access, binary = %binary.display(), pid = child.id(), "method started");
        Ok(Self {
            access: access.to_string(),
            child,
            stdin,
        })
    }
}

impl Transport for MethodProcess {
    fn send(&mut self, message: Message) -> AcquireResult<()> {
        let protocol_err = |reason: String| AcquireError::Protocol {
            access: self.access.clone(),
            reason,
        };
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| protocol_err("method has been shut down".to_string()))?;
        stdin
            .write_all(message.encode().as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| protocol_err(e.to_string()))
    }

    fn shutdown(&mut self) {
        // closing stdin tells a well-behaved method to exit
        self.stdin = None;
        if let Err(e) = self.child.kill() {
            debug!(access = %self.access, error = %e, "method already gone");
        }
        let _ = self.child.wait();
    }
}

impl Drop for MethodProcess {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::sink;
    use super::*;
    use crate::acquire::WorkerEvent;
    use crate::message::{CAPABILITIES, URI_ACQUIRE, URI_DONE};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(temp: &TempDir, body: &str) -> std::path::PathBuf {
        let path = temp.path().join("fake");
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_messages_flow_both_ways() {
        let temp = TempDir::new().unwrap();
        let binary = script(
            &temp,
            "printf '100 Capabilities\\nVersion: 1.0\\nSingle-Instance: true\\n\\n'\n\
             while read line; do\n\
               case \"$line\" in URI:*) uri=${line#URI: } ;; '') [ -n \"$uri\" ] && printf '201 URI Done\\nURI: %s\\nFilename: /tmp/x\\n\\n' \"$uri\"; uri= ;; esac\n\
             done\n",
        );
        let (sink, mut rx) = sink();
        let mut process = MethodProcess::spawn("fake", &binary, sink).unwrap();

        match rx.blocking_recv().unwrap() {
            WorkerEvent::Message { message, .. } => {
                assert_eq!(message.code, CAPABILITIES);
                assert!(message.lookup_bool("Single-Instance", false));
            }
            other => panic!("unexpected event {:?}", other),
        }

        process
            .send(Message::new(URI_ACQUIRE, "URI Acquire").with("URI", "fake://h/a").with("Filename", "/tmp/x"))
            .unwrap();
        match rx.blocking_recv().unwrap() {
            WorkerEvent::Message { message, .. } => {
                assert_eq!(message.code, URI_DONE);
                assert_eq!(message.get("URI"), "fake://h/a");
            }
            other => panic!("unexpected event {:?}", other),
        }
        process.shutdown();
    }

    #[test]
    fn test_exit_reports_closed() {
        let temp = TempDir::new().unwrap();
        let binary = script(&temp, "exit 0\n");
        let (sink, mut rx) = sink();
        let _process = MethodProcess::spawn("fake", &binary, sink).unwrap();
        assert!(matches!(rx.blocking_recv().unwrap(), WorkerEvent::Closed { .. }));
    }

    #[test]
    fn test_missing_binary() {
        let temp = TempDir::new().unwrap();
        let (sink, _rx) = sink();
        let err = MethodProcess::spawn("fake", &temp.path().join("nope"), sink).err().unwrap();
        assert!(matches!(err, AcquireError::WorkerSpawn { .. }));
    }
}
