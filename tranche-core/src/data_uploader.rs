use crate::control::Control;
use crate::error::UploadError;
use crate::events::{Event, EventKind};
use crate::model::DataChunk;
use crate::net::ChunkKind;
use crate::pipeline::Pipeline;
use std::sync::Arc;
use tracing::debug;

struct Finished<'a>(&'a Control);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.data_uploader_finished();
    }
}

pub(crate) fn run(p: Arc<Pipeline>) {
    let _finished = Finished(&p.control);
    loop {
        if p.control.should_halt() {
            break;
        }
        match p.data_q.pop_timeout(p.control.poll()) {
            Some(chunk) => upload(&p, chunk),
            None if p.control.producers_done() && p.data_q.is_empty() => break,
            None => {}
        }
    }
    debug!("data uploader exiting");
}

fn upload(p: &Pipeline, chunk: DataChunk) {
    if chunk.file.is_failed() {
        debug!(
            file = %chunk.file.rel_path,
            hash = %chunk.hash.short(),
            "dropping chunk of failed file"
        );
        return;
    }
    match p.replicator.replicate(ChunkKind::Data, &chunk.hash, &chunk.bytes) {
        Ok(done) => {
            for e in &done.host_errors {
                p.publish(
                    Event::new(EventKind::HostFailed)
                        .hash(chunk.hash)
                        .host(e.host())
                        .message(e.to_string()),
                );
            }
            debug!(
                file = %chunk.file.rel_path,
                hash = %chunk.hash.short(),
                bytes = chunk.bytes.len(),
                hosts = done.core.len() + done.non_core.len(),
                "chunk stored"
            );
            p.publish(
                Event::new(EventKind::ChunkUploaded)
                    .hash(chunk.hash)
                    .file(&chunk.file.rel_path)
                    .bytes(chunk.bytes.len() as u64)
                    .synthetic(chunk.file.flags.is_synthetic()),
            );
            chunk.file.mark_uploaded();
            p.hand_off_record(&chunk.file);
        }
        Err(UploadError::Halted) => debug!(hash = %chunk.hash.short(), "chunk abandoned on halt"),
        Err(e) => p.fail_file(&chunk.file, Some(chunk.hash), e.to_string()),
    }
}
