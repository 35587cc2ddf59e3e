use crate::control::Control;
use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Largest data chunk the network accepts.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

/// Transform applied to a file's bytes. Recorded in this order: `None` always,
/// then `Compression` and `Encryption` when used.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncodingKind {
    None,
    Compression,
    Encryption,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Encoding {
    pub kind: EncodingKind,
    /// Hash of this stage's output.
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub signer: [u8; 32],
    pub bytes: Vec<u8>,
}

impl Signature {
    pub fn sign(key: &SigningKey, hash: &ContentHash) -> Self {
        let sig = key.sign(hash.as_bytes());
        Self { signer: key.verifying_key().to_bytes(), bytes: sig.to_bytes().to_vec() }
    }

    pub fn verify(&self, hash: &ContentHash) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.signer) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(&self.bytes) else {
            return false;
        };
        vk.verify(hash.as_bytes(), &sig).is_ok()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Properties {
    pub name: String,
    pub dataset_path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub uploaded: DateTime<Utc>,
}

/// One uploader's view of a file: who signed it, how it was encoded and which
/// data chunks hold the encoded bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploaderEntry {
    pub signature: Signature,
    pub encodings: Vec<Encoding>,
    pub properties: Properties,
    pub annotations: Vec<Annotation>,
    pub sticky_servers: Vec<String>,
    pub parts: Vec<ContentHash>,
}

impl UploaderEntry {
    fn same_upload(&self, other: &UploaderEntry) -> bool {
        self.signature.signer == other.signature.signer
            && self.encodings == other.encodings
            && self.parts == other.parts
    }
}

/// Per-file metadata chunk, stored under the file's canonical content hash.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MetadataRecord {
    pub hash: ContentHash,
    pub uploaders: Vec<UploaderEntry>,
    /// Queue sort key only; never serialized. Records are not re-queued, so the
    /// pipeline always leaves this at 0.
    #[serde(skip)]
    pub servers_tried: u32,
}

impl MetadataRecord {
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Add the uploader entries of `other` that are not already present.
    /// Existing entries are never replaced. Returns whether anything was added.
    pub fn merge(&mut self, other: &MetadataRecord) -> bool {
        let mut added = false;
        for entry in &other.uploaders {
            if !self.uploaders.iter().any(|e| e.same_upload(entry)) {
                self.uploaders.push(entry.clone());
                added = true;
            }
        }
        added
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: ContentHash,
    pub padding: Vec<u8>,
}

/// Data-set level listing of every member file. Uploaded last; its own content
/// hash is the root hash of a multi-file upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DatasetManifest {
    pub entries: Vec<ManifestEntry>,
    pub license: Option<ContentHash>,
}

impl DatasetManifest {
    /// Canonical bytes: entries sorted by path, so producer interleaving never changes the hash.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut sorted = self.clone();
        sorted.entries.sort_by(|a, b| a.path.cmp(&b.path));
        serde_json::to_vec(&sorted)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug)]
pub enum FileSource {
    Path(PathBuf),
    Synthetic(Vec<u8>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileFlags {
    /// Carries the data-set annotations and sticky servers.
    pub primary: bool,
    pub license: bool,
    pub manifest: bool,
}

impl FileFlags {
    pub fn is_synthetic(&self) -> bool {
        self.license || self.manifest
    }
}

/// One file pending chunking and upload ("FileToUpload").
///
/// Written by exactly one producer; the uploaded counter is bumped by whichever
/// data uploaders handle its chunks.
pub struct FileState {
    pub rel_path: String,
    pub source: FileSource,
    pub padding: Vec<u8>,
    pub flags: FileFlags,
    produced: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicBool,
    ready: AtomicBool,
    submitted: AtomicBool,
    target: OnceLock<u64>,
    hash: OnceLock<ContentHash>,
    parts: Mutex<Vec<ContentHash>>,
    entry: Mutex<Option<UploaderEntry>>,
}

impl FileState {
    pub fn new(rel_path: String, source: FileSource, padding: Vec<u8>, flags: FileFlags) -> Self {
        Self {
            rel_path,
            source,
            padding,
            flags,
            produced: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            target: OnceLock::new(),
            hash: OnceLock::new(),
            parts: Mutex::new(Vec::new()),
            entry: Mutex::new(None),
        }
    }

    /// Returns `true` for the call that actually failed the file.
    pub fn mark_failed(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> Option<u64> {
        self.target.get().copied()
    }

    pub fn hash(&self) -> Option<ContentHash> {
        self.hash.get().copied()
    }

    /// Producer side: remember the chunk's position before it is queued.
    pub(crate) fn record_chunk(&self, hash: ContentHash) {
        self.parts.lock().push(hash);
        self.produced.fetch_add(1, Ordering::SeqCst);
    }

    /// Uploader side: one more chunk durably stored. Returns the new count.
    pub(crate) fn mark_uploaded(&self) -> u64 {
        self.uploaded.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Producer side: the record is complete. The target count is published last,
    /// so an uploader that observes it also observes the signed entry.
    pub(crate) fn finish(&self, hash: ContentHash, entry: UploaderEntry) {
        let _ = self.hash.set(hash);
        *self.entry.lock() = Some(entry);
        self.ready.store(true, Ordering::SeqCst);
        let _ = self.target.set(self.produced());
    }

    /// Hand out the metadata record exactly once, when every produced chunk is
    /// uploaded and the producer has finished the record. Waits (halt-aware)
    /// for the producer's signature if the last chunk outran it.
    pub(crate) fn take_record_if_complete(&self, control: &Control) -> Option<MetadataRecord> {
        let target = self.target()?;
        if self.uploaded() != target {
            return None;
        }
        while !self.ready.load(Ordering::SeqCst) {
            if !control.nap() {
                return None;
            }
        }
        if self.submitted.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return None;
        }
        let parts = self.parts.lock().clone();
        debug_assert_eq!(parts.len() as u64, target);
        let mut entry = self.entry.lock().clone()?;
        entry.parts = parts;
        Some(MetadataRecord { hash: self.hash()?, uploaders: vec![entry], servers_tried: 0 })
    }
}

/// Immutable slice of a file's encoded stream.
pub struct DataChunk {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
    pub file: Arc<FileState>,
    /// Queue sort key. Chunks are not re-queued after a failed replication, so
    /// the pipeline always leaves this at 0.
    pub servers_tried: u32,
}

/// A finished metadata record travelling to the metadata uploaders.
pub struct MetaChunk {
    pub record: MetadataRecord,
    pub file: Arc<FileState>,
}
