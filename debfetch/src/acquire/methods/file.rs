//! `file:` sources. The file is used where it is, never copied.

use crate::acquire::{EventSink, MethodConfig};
use crate::message::Message;

use super::{local_capabilities, FetchRequest, Method};

#[derive(Debug, Default, Clone, Copy)]
pub struct FileMethod;

impl Method for FileMethod {
    fn config(&self) -> MethodConfig {
        let mut cnf = local_capabilities("file");
        cnf.send_config = true;
        cnf
    }

    fn fetch(&mut self, request: &FetchRequest, sink: &EventSink) -> Message {
        let source = &request.path;
        if !source.is_file() {
            return request.failure("File not found");
        }

        if request.not_modified(source) {
            let mut msg = request.ims_hit();
            msg.set("Filename", source.display().to_string());
            return msg;
        }

        let size = source.metadata().map(|m| m.len()).unwrap_or(0);
        sink.send(request.started(size, 0));
        request.done(source).unwrap_or_else(|e| request.failure(e))
    }
}
