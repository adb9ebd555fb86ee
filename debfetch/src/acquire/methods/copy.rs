//! `copy:` pivots: copy a local file to the requested destination.

use std::fs;

use tracing::debug;

use crate::acquire::{EventSink, MethodConfig};
use crate::message::Message;

use super::{local_capabilities, FetchRequest, Method};

#[derive(Debug, Default, Clone, Copy)]
pub struct CopyMethod;

impl Method for CopyMethod {
    fn config(&self) -> MethodConfig {
        let mut cnf = local_capabilities("copy");
        cnf.send_config = true;
        cnf
    }

    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message {
        let source = &request.path;
        let size = match fs::metadata(source) {
            Ok(meta) => meta.len(),
            Err(e) => return request.failure(format!("Failed to stat {}: {}", source.display(), e)),
        };
        sink.send(request.started(size, 0));

        if source != &request.filename {
            if let Err(e) = fs::copy(source, &request.filename) {
                debug!(source = %source.display(), dest = %request.filename.display(), error = %e, "copy failed");
                return request.failure(format!("Failed to copy {}: {}", source.display(), e));
            }
            // keep the source timestamp for later conditional requests
            if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
                let time = filetime::FileTime::from_system_time(modified);
                let _ = filetime::set_file_mtime(&request.filename, time);
            }
        }
        request
            .done(&request.filename)
            .unwrap_or_else(|e| request.failure(e))
    }
}
