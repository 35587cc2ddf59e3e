use crate::events::{Event, EventKind};
use crate::hash::ContentHash;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const REPORT_VERSION: u32 = 1;
const REPORT_MAGIC: &[u8; 8] = b"TRNCRPT\0";
/// Upper bound on the encoded report body accepted by `read_from`.
pub const MAX_REPORT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub file: Option<String>,
    pub hash: Option<ContentHash>,
    pub message: String,
}

/// Outcome of one upload session. `hash` is only set when every file, and the
/// manifest for multi-file uploads, has been replicated and verified.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub version: u32,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub title: String,
    pub description: String,
    pub encrypted: bool,
    pub hash: Option<ContentHash>,
    /// Encoded chunk bytes confirmed on the network.
    pub bytes_uploaded: u64,
    /// Estimated source bytes, adjusted as archives expand.
    pub bytes_total: u64,
    pub files_uploaded: u64,
    pub files_total: u64,
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn new(title: &str, description: &str, encrypted: bool) -> Self {
        Self {
            version: REPORT_VERSION,
            started: Utc::now(),
            finished: None,
            title: title.to_string(),
            description: description.to_string(),
            encrypted,
            hash: None,
            bytes_uploaded: 0,
            bytes_total: 0,
            files_uploaded: 0,
            files_total: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn add_failure(
        &mut self,
        file: Option<String>,
        hash: Option<ContentHash>,
        message: String,
    ) {
        self.failures.push(Failure { file, hash, message });
    }

    /// Fold one pipeline event into the totals and failure list.
    pub fn apply(&mut self, e: &Event) {
        match e.kind {
            EventKind::ChunkUploaded => self.bytes_uploaded += e.bytes,
            EventKind::FileFinished if !e.synthetic => self.files_uploaded += 1,
            EventKind::FileFailed | EventKind::SessionFailed => self.add_failure(
                e.file.clone(),
                e.hash,
                e.message.clone().unwrap_or_else(|| "upload failed".into()),
            ),
            _ => {}
        }
    }

    /// Persist as a versioned record: magic, version, length, bincode payload, CRC32.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let payload = bincode::serialize(self).context("serialize report")?;
        let mut h = Crc32::new();
        h.update(&payload);
        let crc = h.finalize();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp =
            NamedTempFile::new_in(dir).with_context(|| format!("temp file in {:?}", dir))?;
        tmp.write_all(REPORT_MAGIC)?;
        tmp.write_all(&REPORT_VERSION.to_le_bytes())?;
        tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
        tmp.write_all(&payload)?;
        tmp.write_all(&crc.to_le_bytes())?;
        tmp.as_file().sync_all().context("sync report")?;
        tmp.persist(path).with_context(|| format!("persist {:?}", path))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let mut f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let mut head = [0u8; 16];
        f.read_exact(&mut head).context("report too short")?;
        if &head[..8] != REPORT_MAGIC {
            bail!("bad report magic");
        }
        let mut v4 = [0u8; 4];
        v4.copy_from_slice(&head[8..12]);
        let version = u32::from_le_bytes(v4);
        if version != REPORT_VERSION {
            bail!("unsupported report version {}", version);
        }
        let mut l4 = [0u8; 4];
        l4.copy_from_slice(&head[12..16]);
        let len = u32::from_le_bytes(l4) as usize;
        if len > MAX_REPORT_BYTES {
            bail!("report payload of {} bytes exceeds limit {}", len, MAX_REPORT_BYTES);
        }
        let mut payload = vec![0u8; len];
        f.read_exact(&mut payload).context("report payload truncated")?;
        let mut crc4 = [0u8; 4];
        f.read_exact(&mut crc4).context("report trailer truncated")?;
        let mut h = Crc32::new();
        h.update(&payload);
        if h.finalize() != u32::from_le_bytes(crc4) {
            bail!("report CRC mismatch");
        }
        bincode::deserialize(&payload).context("bincode report decode")
    }
}
