//! Storage servers backed by local directories. Each server root holds
//! `data/<hex>` and `meta/<hex>` files. A server whose root directory does not
//! exist is treated as unreachable.

use super::{fan_out, ChunkKind, ChunkStore, Connector};
use crate::error::StoreError;
use crate::hash::ContentHash;
use crate::topology::{HostId, ServerInfo, Topology};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DirServerConfig {
    #[serde(flatten)]
    pub info: ServerInfo,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DirNetworkConfig {
    pub servers: Vec<DirServerConfig>,
}

#[derive(Clone, Debug, Default)]
pub struct DirNetwork {
    servers: Arc<BTreeMap<HostId, DirServerConfig>>,
}

impl DirNetwork {
    pub fn new(cfg: DirNetworkConfig) -> Self {
        let servers = cfg.servers.into_iter().map(|s| (s.info.host.clone(), s)).collect();
        Self { servers: Arc::new(servers) }
    }

    /// Load a network description; relative server paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let mut cfg: DirNetworkConfig =
            serde_json::from_reader(f).with_context(|| format!("parse {:?}", path))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for s in &mut cfg.servers {
            if s.path.is_relative() {
                s.path = base.join(&s.path);
            }
        }
        Ok(Self::new(cfg))
    }
}

impl Topology for DirNetwork {
    fn servers(&self) -> Vec<ServerInfo> {
        self.servers.values().map(|s| s.info.clone()).collect()
    }
}

impl Connector for DirNetwork {
    fn connect(&self, host: &str) -> Result<Arc<dyn ChunkStore>, StoreError> {
        let cfg = self.servers.get(host).ok_or_else(|| StoreError::Unreachable(host.to_string()))?;
        if !cfg.path.is_dir() {
            return Err(StoreError::Unreachable(host.to_string()));
        }
        for sub in ["data", "meta"] {
            fs::create_dir_all(cfg.path.join(sub)).map_err(|e| StoreError::Io {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(Arc::new(DirConn {
            host: host.to_string(),
            root: cfg.path.clone(),
            network: self.clone(),
        }))
    }
}

struct DirConn {
    host: HostId,
    root: PathBuf,
    network: DirNetwork,
}

impl DirConn {
    fn path_for(&self, kind: ChunkKind, hash: &ContentHash) -> PathBuf {
        let sub = match kind {
            ChunkKind::Data => "data",
            ChunkKind::Meta => "meta",
        };
        self.root.join(sub).join(hash.to_hex())
    }

    fn io_err(&self, e: impl std::fmt::Display) -> StoreError {
        StoreError::Io { host: self.host.clone(), reason: e.to_string() }
    }

    fn store(
        &self,
        kind: ChunkKind,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError> {
        let dest = self.path_for(kind, hash);
        let dir = dest.parent().unwrap_or(&self.root);
        // write-then-rename so readers never see a partial chunk
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(bytes).map_err(|e| self.io_err(e))?;
        tmp.persist(&dest).map_err(|e| self.io_err(e))?;
        Ok(fan_out(&self.network, &self.host, kind, hash, bytes, propagate))
    }
}

impl ChunkStore for DirConn {
    fn put_data(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError> {
        self.store(ChunkKind::Data, hash, bytes, propagate)
    }

    fn put_meta(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError> {
        self.store(ChunkKind::Meta, hash, bytes, propagate)
    }

    fn has_data(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.path_for(ChunkKind::Data, hash).is_file())
    }

    fn has_meta(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.path_for(ChunkKind::Meta, hash).is_file())
    }

    fn get_meta(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        let p = self.path_for(ChunkKind::Meta, hash);
        match fs::read(&p) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }
}
