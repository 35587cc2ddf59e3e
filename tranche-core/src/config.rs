use crate::model::{Annotation, MAX_CHUNK_SIZE};
use crate::queue::{DEFAULT_DATA_CAPACITY, DEFAULT_META_CAPACITY};
use crate::topology::HostId;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_THREADS: usize = 10;
pub const DEFAULT_MIN_THREADS: usize = 6;
pub const DEFAULT_REPLICATION: usize = 2;
pub const PRODUCER_THREADS: usize = 2;

/// Identity that signs every uploaded file.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub signing_key: SigningKey,
    pub expires: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(user: &str, signing_key: SigningKey) -> Self {
        Self { user: user.to_string(), signing_key, expires: None }
    }

    /// Parse a 32-byte ed25519 seed written as 64 hex digits.
    pub fn from_seed_hex(user: &str, seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim()).context("signing seed is not valid hex")?;
        let seed: [u8; 32] = match bytes.try_into() {
            Ok(seed) => seed,
            Err(b) => bail!("signing seed must be 32 bytes, got {}", b.len()),
        };
        Ok(Self::new(user, SigningKey::from_bytes(&seed)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(t) if t <= now)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("public_key", &self.signing_key.verifying_key())
            .field("expires", &self.expires)
            .finish()
    }
}

/// Worker pool sizes derived from the configured thread budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadPlan {
    pub producers: usize,
    pub data_uploaders: usize,
    pub meta_uploaders: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct UploadConfig {
    pub source: PathBuf,
    pub title: String,
    pub description: String,
    pub passphrase: Option<String>,
    pub compress: bool,
    pub expand_archives: bool,
    pub exclude: Vec<String>,
    /// Skip the metadata stage entirely.
    pub data_only: bool,
    pub threads: usize,
    pub min_threads: usize,
    pub replication_factor: usize,
    pub chunk_size: usize,
    pub data_queue_capacity: usize,
    pub meta_queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub servers: Vec<HostId>,
    pub sticky_servers: Vec<HostId>,
    pub use_unspecified_servers: bool,
    pub annotations: Vec<Annotation>,
    /// License text uploaded alongside the data set and referenced by its manifest.
    pub license: Option<String>,
    pub license_name: String,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            title: String::new(),
            description: String::new(),
            passphrase: None,
            compress: false,
            expand_archives: false,
            exclude: Vec::new(),
            data_only: false,
            threads: DEFAULT_THREADS,
            min_threads: DEFAULT_MIN_THREADS,
            replication_factor: DEFAULT_REPLICATION,
            chunk_size: MAX_CHUNK_SIZE,
            data_queue_capacity: DEFAULT_DATA_CAPACITY,
            meta_queue_capacity: DEFAULT_META_CAPACITY,
            poll_interval_ms: 100,
            servers: Vec::new(),
            sticky_servers: Vec::new(),
            use_unspecified_servers: true,
            annotations: Vec::new(),
            license: None,
            license_name: "LICENSE.txt".into(),
            credentials: None,
        }
    }
}

impl UploadConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("parse {:?}", path))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.passphrase.as_deref(), Some(p) if !p.is_empty())
    }

    pub fn thread_plan(&self) -> ThreadPlan {
        let total = self.threads.max(self.min_threads).max(PRODUCER_THREADS + 1);
        let remaining = total - PRODUCER_THREADS;
        let meta = if self.data_only { 0 } else { remaining.div_ceil(2) + 1 };
        ThreadPlan {
            producers: PRODUCER_THREADS,
            data_uploaders: remaining.saturating_sub(meta).max(1),
            meta_uploaders: meta,
        }
    }
}
