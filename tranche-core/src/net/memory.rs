//! In-process storage network. Every server keeps its chunks in memory and
//! forwards to its peers directly. Faults can be injected per server, which is
//! how the pipeline's failure handling is exercised.

use super::{fan_out, ChunkKind, ChunkStore, Connector};
use crate::error::StoreError;
use crate::hash::ContentHash;
use crate::topology::{HostId, ServerInfo, Topology};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One stored chunk, in the order servers accepted them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRecord {
    pub host: HostId,
    pub kind: ChunkKind,
    pub hash: ContentHash,
}

#[derive(Default)]
pub struct MemoryServer {
    info: Mutex<Option<ServerInfo>>,
    data: Mutex<HashMap<ContentHash, Vec<u8>>>,
    meta: Mutex<HashMap<ContentHash, Vec<u8>>>,
    unreachable: AtomicBool,
    reject_puts: AtomicBool,
    deny_has: AtomicBool,
    put_delay_ms: AtomicU64,
    put_calls: AtomicUsize,
}

impl MemoryServer {
    pub fn info(&self) -> Option<ServerInfo> {
        self.info.lock().clone()
    }

    /// Connection attempts fail while set.
    pub fn set_unreachable(&self, on: bool) {
        self.unreachable.store(on, Ordering::SeqCst);
    }

    /// Every put is refused while set.
    pub fn set_reject_puts(&self, on: bool) {
        self.reject_puts.store(on, Ordering::SeqCst);
    }

    /// `has_*` answers `false` while set, even for stored chunks.
    pub fn set_deny_has(&self, on: bool) {
        self.deny_has.store(on, Ordering::SeqCst);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn data_chunk(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.data.lock().get(hash).cloned()
    }

    pub fn meta_chunk(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.meta.lock().get(hash).cloned()
    }
}

#[derive(Default)]
struct Inner {
    servers: Mutex<BTreeMap<HostId, Arc<MemoryServer>>>,
    log: Mutex<Vec<StoreRecord>>,
}

/// Cheap to clone; all clones share the same servers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network of `n` core servers named `core-0..n`, each covering the full hash space.
    pub fn with_core_servers(n: usize) -> Self {
        let net = Self::new();
        for i in 0..n {
            net.add_server(ServerInfo::core(&format!("core-{i}")));
        }
        net
    }

    pub fn add_server(&self, info: ServerInfo) -> Arc<MemoryServer> {
        let server = Arc::new(MemoryServer::default());
        let host = info.host.clone();
        *server.info.lock() = Some(info);
        self.inner.servers.lock().insert(host, server.clone());
        server
    }

    pub fn server(&self, host: &str) -> Option<Arc<MemoryServer>> {
        self.inner.servers.lock().get(host).cloned()
    }

    pub fn hosts(&self) -> Vec<HostId> {
        self.inner.servers.lock().keys().cloned().collect()
    }

    pub fn total_put_calls(&self) -> usize {
        self.inner.servers.lock().values().map(|s| s.put_calls()).sum()
    }

    /// Every accepted store, across all servers, in acceptance order.
    pub fn store_log(&self) -> Vec<StoreRecord> {
        self.inner.log.lock().clone()
    }

    /// Hosts currently holding the data chunk.
    pub fn data_holders(&self, hash: &ContentHash) -> Vec<HostId> {
        self.inner
            .servers
            .lock()
            .iter()
            .filter(|(_, s)| s.data.lock().contains_key(hash))
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn meta_holders(&self, hash: &ContentHash) -> Vec<HostId> {
        self.inner
            .servers
            .lock()
            .iter()
            .filter(|(_, s)| s.meta.lock().contains_key(hash))
            .map(|(h, _)| h.clone())
            .collect()
    }
}

impl Topology for MemoryNetwork {
    fn servers(&self) -> Vec<ServerInfo> {
        self.inner.servers.lock().values().filter_map(|s| s.info()).collect()
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, host: &str) -> Result<Arc<dyn ChunkStore>, StoreError> {
        let server = self.server(host).ok_or_else(|| StoreError::Unreachable(host.to_string()))?;
        if server.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable(host.to_string()));
        }
        Ok(Arc::new(MemoryConn { host: host.to_string(), server, network: self.clone() }))
    }
}

struct MemoryConn {
    host: HostId,
    server: Arc<MemoryServer>,
    network: MemoryNetwork,
}

impl MemoryConn {
    fn store(
        &self,
        kind: ChunkKind,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError> {
        self.server.put_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.server.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if self.server.reject_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                host: self.host.clone(),
                hash: *hash,
                reason: "writes refused".into(),
            });
        }
        let map = match kind {
            ChunkKind::Data => &self.server.data,
            ChunkKind::Meta => &self.server.meta,
        };
        map.lock().insert(*hash, bytes.to_vec());
        self.network.inner.log.lock().push(StoreRecord {
            host: self.host.clone(),
            kind,
            hash: *hash,
        });
        Ok(fan_out(&self.network, &self.host, kind, hash, bytes, propagate))
    }

    fn holds(&self, kind: ChunkKind, hash: &ContentHash) -> bool {
        if self.server.deny_has.load(Ordering::SeqCst) {
            return false;
        }
        match kind {
            ChunkKind::Data => self.server.data.lock().contains_key(hash),
            ChunkKind::Meta => self.server.meta.lock().contains_key(hash),
        }
    }
}

impl ChunkStore for MemoryConn {
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
        Ok(self.holds(ChunkKind::Data, hash))
    }

    fn has_meta(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.holds(ChunkKind::Meta, hash))
    }

    fn get_meta(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.server.meta_chunk(hash))
    }
}
