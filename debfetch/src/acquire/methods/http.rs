//! `http:` and `https:` downloads.
//!
//! Uses a blocking `reqwest` client on the method thread:
//! - Range requests resume an existing partial file
//! - `If-Modified-Since` turns an unchanged file into an `IMS-Hit`
//! - the server's `Last-Modified` is stamped on the result

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use filetime::FileTime;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, IF_MODIFIED_SINCE, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::acquire::{EventSink, MethodConfig};
use crate::config::AcquireConfig;
use crate::error::{AcquireError, AcquireResult};
use crate::interrupt;
use crate::message::Message;
use crate::uri::{parse_rfc1123, time_rfc1123};

use super::{FetchRequest, Method, METHOD_VERSION};

/// Buffer size for reading/writing during downloads (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

pub(super) fn capabilities(access: &str) -> MethodConfig {
    let mut cnf = MethodConfig::new(access);
    cnf.version = METHOD_VERSION.to_string();
    cnf.pipeline = true;
    cnf.send_config = true;
    cnf
}

#[derive(Debug)]
pub struct HttpMethod {
    access: String,
    client: Client,
}

impl HttpMethod {
    pub fn new(access: &str, config: &AcquireConfig) -> AcquireResult<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(format!("debfetch/{}", METHOD_VERSION))
            .build()
            .map_err(|e| AcquireError::WorkerSpawn {
                access: access.to_string(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            access: access.to_string(),
            client,
        })
    }

    fn send(&self, request: &FetchRequest, resume_from: u64) -> Result<Response, Message> {
        let mut builder = self.client.get(&request.uri);
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", resume_from));
        } else if let Some(since) = request.last_modified {
            builder = builder.header(IF_MODIFIED_SINCE, time_rfc1123(since));
        }

        builder.send().map_err(|e| {
            debug!(uri = %request.uri, error = %e, "request failed");
            if e.is_timeout() {
                request.transient_failure("Connection timed out", "Timeout")
            } else if e.is_connect() {
                let text = e.to_string();
                if text.contains("dns") {
                    request.transient_failure(format!("Could not resolve host: {}", text), "TmpResolveFailure")
                } else {
                    request.transient_failure(format!("Could not connect: {}", text), "ConnectionRefused")
                }
            } else {
                request.failure(e.to_string()).with("FailReason", "ConnectionFailed")
            }
        })
    }

    /// Stream the body to `path`, appending when the server honoured the range.
    fn stream(
        &self,
        request: &FetchRequest,
        mut response: Response,
        append: bool,
        modified: Option<SystemTime>,
    ) -> Result<(), Message> {
        let path = &request.filename;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| request.failure(format!("Failed to open {}: {}", path.display(), e)))?;

        interrupt::begin(path, modified);
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let result = loop {
            match response.read(&mut buffer) {
                Ok(0) => break writer.flush().map_err(|e| e.to_string()),
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buffer[..n]) {
                        break Err(e.to_string());
                    }
                }
                Err(e) => break Err(format!("Error reading from server: {}", e)),
            }
        };
        drop(writer);

        match result {
            Ok(()) => {
                interrupt::end();
                if let Some(modified) = modified {
                    stamp(path, modified);
                }
                Ok(())
            }
            Err(text) => {
                // keep the partial file and its timestamp for the next run
                interrupt::finalize();
                Err(request.transient_failure(text, "Timeout"))
            }
        }
    }
}

fn stamp(path: &Path, time: SystemTime) {
    let time = FileTime::from_system_time(time);
    if let Err(e) = filetime::set_file_mtime(path, time) {
        warn!(path = %path.display(), error = %e, "failed to set modification time");
    }
}

/// Failure message for an HTTP error status.
fn status_failure(request: &FetchRequest, status: StatusCode) -> Message {
    let text = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    let msg = request
        .failure(text.trim())
        .with("FailReason", format!("HttpError{}", status.as_u16()));
    if status.is_server_error() {
        msg.with("Transient-Failure", "true")
    } else {
        msg
    }
}

impl Method for HttpMethod {
    fn config(&self) -> MethodConfig {
        capabilities(&self.access)
    }

    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message {
        let resume_from = fs::metadata(&request.filename).map(|m| m.len()).unwrap_or(0);
        let response = match self.send(request, resume_from) {
            Ok(response) => response,
            Err(msg) => return msg,
        };

        let status = response.status();
        debug!(uri = %request.uri, status = status.as_u16(), resume_from, "response");
        let modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_rfc1123);

        let append = match status {
            StatusCode::NOT_MODIFIED => return request.ims_hit(),
            // the partial file is already complete
            StatusCode::RANGE_NOT_SATISFIABLE if resume_from > 0 => {
                return request
                    .done(&request.filename)
                    .unwrap_or_else(|e| request.failure(e));
            }
            StatusCode::PARTIAL_CONTENT => true,
            s if s.is_success() => false,
            s => return status_failure(request, s),
        };

        let resume_point = if append { resume_from } else { 0 };
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        sink.send(request.started(length + resume_point, resume_point));

        if let Err(msg) = self.stream(request, response, append, modified) {
            return msg;
        }

        match request.done(&request.filename) {
            Ok(mut msg) => {
                if resume_point > 0 {
                    msg.set("Resume-Point", resume_point.to_string());
                }
                msg
            }
            Err(e) => request.failure(e),
        }
    }
}
