use crate::error::UploadError;
use crate::events::{Event, EventKind};
use crate::model::{MetaChunk, MetadataRecord};
use crate::net::ChunkKind;
use crate::pipeline::Pipeline;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Releases one in-flight slot on drop, so a panicking upload cannot keep the
/// manifest waiting forever.
struct InFlight<'a>(&'a Mutex<usize>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut n = self.0.lock();
        *n = n.saturating_sub(1);
    }
}

enum Next {
    Record(MetaChunk),
    Idle,
    Done,
}

/// Ordinary records first. The manifest only once nothing else can still arrive.
fn next(p: &Pipeline) -> Next {
    let mut in_flight = p.meta_in_flight.lock();
    if let Some(c) = p.meta_q.try_pop() {
        *in_flight += 1;
        return Next::Record(c);
    }
    if *in_flight > 0 || !p.control.data_uploaders_done() || !p.meta_q.is_empty() {
        return Next::Idle;
    }
    match p.manifest_slot.take() {
        Some(m) => {
            *in_flight += 1;
            Next::Record(m)
        }
        None => Next::Done,
    }
}

pub(crate) fn run(p: Arc<Pipeline>) {
    loop {
        if p.control.should_halt() {
            break;
        }
        match next(&p) {
            Next::Record(chunk) => {
                let _slot = InFlight(&p.meta_in_flight);
                upload(&p, chunk);
            }
            Next::Idle => {
                if !p.control.nap() {
                    break;
                }
            }
            Next::Done => break,
        }
    }
    debug!("metadata uploader exiting");
}

fn upload(p: &Pipeline, chunk: MetaChunk) {
    let MetaChunk { record, file } = chunk;
    if file.is_failed() {
        return;
    }
    let hash = record.hash;
    let merged = match p.replicator.existing_meta(&hash) {
        Ok(Some(mut existing)) => {
            if existing.merge(&record) {
                debug!(file = %file.rel_path, "added uploader to existing metadata");
            } else {
                debug!(file = %file.rel_path, "uploader already present in metadata");
            }
            existing
        }
        Ok(None) => record,
        Err(UploadError::Halted) => return,
        Err(e) => {
            p.fail_file(&file, Some(hash), e.to_string());
            return;
        }
    };
    let result = encode(&merged).and_then(|bytes| {
        p.replicator.replicate(ChunkKind::Meta, &hash, &bytes).map(|done| (done, bytes.len()))
    });
    match result {
        Ok((done, len)) => {
            for e in &done.host_errors {
                p.publish(
                    Event::new(EventKind::HostFailed)
                        .hash(hash)
                        .host(e.host())
                        .message(e.to_string()),
                );
            }
            info!(file = %file.rel_path, uploaders = merged.uploaders.len(), "metadata stored");
            p.publish(
                Event::new(EventKind::MetaUploaded)
                    .hash(hash)
                    .file(&file.rel_path)
                    .bytes(len as u64)
                    .synthetic(file.flags.is_synthetic()),
            );
            p.file_finished(&file, hash);
        }
        Err(UploadError::Halted) => debug!(file = %file.rel_path, "metadata abandoned on halt"),
        Err(e) => p.fail_file(&file, Some(hash), e.to_string()),
    }
}

fn encode(record: &MetadataRecord) -> Result<Vec<u8>, UploadError> {
    Ok(record.to_bytes()?)
}
