//! State shared by every worker of one running session.

use crate::archive::ArchiveExpander;
use crate::config::UploadConfig;
use crate::control::Control;
use crate::events::{Event, EventBus, EventKind};
use crate::hash::ContentHash;
use crate::model::{DataChunk, FileState, ManifestEntry, MetaChunk};
use crate::queue::{ChunkQueue, ManifestSlot};
use crate::replicate::Replicator;
use ed25519_dalek::SigningKey;
use globset::GlobSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;
use tracing::{debug, error, info};

pub(crate) enum WorkItem {
    Dir(PathBuf),
    File(Arc<FileState>),
}

/// Depth-first stack of pending files and directories shared by the producers.
/// The counter beside the deque tracks producers holding an item, so "empty and
/// idle" is observed atomically with the pop.
#[derive(Default)]
pub(crate) struct WorkStack {
    inner: Mutex<(VecDeque<WorkItem>, usize)>,
}

impl WorkStack {
    pub fn push_back(&self, item: WorkItem) {
        self.inner.lock().0.push_back(item);
    }

    /// Push `items` so the first one is popped next.
    pub fn push_front_all(&self, items: Vec<WorkItem>) {
        let mut g = self.inner.lock();
        for item in items.into_iter().rev() {
            g.0.push_front(item);
        }
    }

    /// Pop the next item. The stack counts the caller busy until the returned
    /// guard drops, which must happen after any children are pushed.
    pub fn pop(&self) -> Option<(WorkItem, Busy<'_>)> {
        let mut g = self.inner.lock();
        let item = g.0.pop_front()?;
        g.1 += 1;
        Some((item, Busy(self)))
    }

    pub fn is_idle(&self) -> bool {
        let g = self.inner.lock();
        g.0.is_empty() && g.1 == 0
    }
}

pub(crate) struct Busy<'a>(&'a WorkStack);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        let mut g = self.0.inner.lock();
        g.1 = g.1.saturating_sub(1);
    }
}

#[derive(Default)]
pub(crate) struct ManifestState {
    pub entries: Vec<ManifestEntry>,
    pub license: Option<ContentHash>,
    pub license_done: bool,
}

pub(crate) struct Pipeline {
    pub cfg: UploadConfig,
    pub control: Arc<Control>,
    pub bus: EventBus,
    pub data_q: ChunkQueue<DataChunk>,
    pub meta_q: ChunkQueue<MetaChunk>,
    pub manifest_slot: ManifestSlot,
    /// Metadata uploads currently in flight; guards the manifest hand-out.
    pub meta_in_flight: Mutex<usize>,
    pub replicator: Replicator,
    pub work: WorkStack,
    pub signing_key: SigningKey,
    pub padding: Vec<u8>,
    pub excludes: GlobSet,
    pub expanders: Vec<Arc<dyn ArchiveExpander>>,
    /// Parent of the source; data-set paths are relative to it.
    pub base: PathBuf,
    /// Whether a manifest ties the uploaded files together.
    pub with_manifest: bool,
    pub manifest: Mutex<ManifestState>,
    pub manifest_claimed: AtomicBool,
    pub root: OnceLock<ContentHash>,
    pub files_estimate: AtomicU64,
    pub bytes_estimate: AtomicU64,
    pub files_started: AtomicUsize,
    pub files_finished: AtomicUsize,
    scratch: Mutex<Option<TempDir>>,
    scratch_seq: AtomicU64,
}

pub(crate) struct PipelineParts {
    pub cfg: UploadConfig,
    pub control: Arc<Control>,
    pub bus: EventBus,
    pub replicator: Replicator,
    pub signing_key: SigningKey,
    pub excludes: GlobSet,
    pub expanders: Vec<Arc<dyn ArchiveExpander>>,
    pub base: PathBuf,
    pub with_manifest: bool,
    pub files_estimate: u64,
    pub bytes_estimate: u64,
}

impl Pipeline {
    pub fn new(p: PipelineParts) -> Self {
        let padding = crate::encoding::padding_for(p.cfg.passphrase.as_deref());
        Self {
            data_q: ChunkQueue::new(p.cfg.data_queue_capacity),
            meta_q: ChunkQueue::new(p.cfg.meta_queue_capacity),
            manifest_slot: ManifestSlot::default(),
            meta_in_flight: Mutex::new(0),
            work: WorkStack::default(),
            padding,
            manifest: Mutex::new(ManifestState::default()),
            manifest_claimed: AtomicBool::new(false),
            root: OnceLock::new(),
            files_estimate: AtomicU64::new(p.files_estimate),
            bytes_estimate: AtomicU64::new(p.bytes_estimate),
            files_started: AtomicUsize::new(0),
            files_finished: AtomicUsize::new(0),
            scratch: Mutex::new(None),
            scratch_seq: AtomicU64::new(0),
            cfg: p.cfg,
            control: p.control,
            bus: p.bus,
            replicator: p.replicator,
            signing_key: p.signing_key,
            excludes: p.excludes,
            expanders: p.expanders,
            base: p.base,
            with_manifest: p.with_manifest,
        }
    }

    pub fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Fresh directory for one archive's members, created lazily under the
    /// session scratch directory and removed with the pipeline.
    pub fn scratch_dir(&self) -> anyhow::Result<PathBuf> {
        let mut g = self.scratch.lock();
        if g.is_none() {
            *g = Some(tempfile::Builder::new().prefix("tranche-expand-").tempdir()?);
        }
        let root = match g.as_ref() {
            Some(td) => td.path().to_path_buf(),
            None => anyhow::bail!("scratch directory unavailable"),
        };
        let dir = root.join(self.scratch_seq.fetch_add(1, Ordering::SeqCst).to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Fail one file, record it in the report, and halt every pool.
    /// Failures observed while already halting are the halt itself and stay silent.
    pub fn fail_file(&self, file: &FileState, hash: Option<ContentHash>, message: String) {
        if !file.mark_failed() {
            return;
        }
        if self.control.should_halt() {
            debug!(file = %file.rel_path, error = %message, "file abandoned on halt");
            return;
        }
        error!(file = %file.rel_path, error = %message, "file failed");
        let mut ev = Event::new(EventKind::FileFailed)
            .file(&file.rel_path)
            .synthetic(file.flags.is_synthetic())
            .message(message);
        ev.hash = hash.or_else(|| file.hash());
        self.publish(ev);
        self.control.halt();
    }

    pub fn fail_session(&self, message: &str) {
        error!(error = %message, "session failed");
        self.publish(Event::new(EventKind::SessionFailed).message(message));
        self.control.halt();
    }

    /// Durability boundary: the file's data and metadata are replicated.
    pub fn file_finished(&self, file: &FileState, hash: ContentHash) {
        self.files_finished.fetch_add(1, Ordering::SeqCst);
        info!(file = %file.rel_path, hash = %hash.short(), "file uploaded");
        self.publish(
            Event::new(EventKind::FileFinished)
                .hash(hash)
                .file(&file.rel_path)
                .synthetic(file.flags.is_synthetic()),
        );
    }

    /// Forward a finished record to the metadata stage once every chunk of
    /// `file` is stored. Called by the uploader that stored the last chunk and
    /// by the producer after finishing the record; exactly one of them wins.
    pub fn hand_off_record(&self, file: &Arc<FileState>) {
        let Some(record) = file.take_record_if_complete(&self.control) else { return };
        if file.is_failed() {
            return;
        }
        if self.cfg.data_only {
            self.file_finished(file, record.hash);
            return;
        }
        let chunk = MetaChunk { record, file: file.clone() };
        if file.flags.manifest {
            self.manifest_slot.put(chunk);
        } else if self.meta_q.push(chunk, &self.control).is_err() {
            debug!(file = %file.rel_path, "metadata hand-off abandoned on halt");
        }
    }
}
