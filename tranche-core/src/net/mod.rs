//! Storage server access: the per-server RPC surface and the backends shipped with the crate.

use crate::error::StoreError;
use crate::hash::ContentHash;
use crate::topology::HostId;
use std::sync::Arc;

pub mod dir;
pub mod memory;

/// Which of the two chunk namespaces an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Data,
    Meta,
}

/// One connection to a storage server.
///
/// The `put_*` calls accept a propagation list: the server stores the chunk and then
/// forwards it to each listed host. Forwarding failures come back as the `Ok` list;
/// only a failure to store locally is an `Err`.
pub trait ChunkStore: Send + Sync {
    fn put_data(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError>;
    fn put_meta(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError>;
    fn has_data(&self, hash: &ContentHash) -> Result<bool, StoreError>;
    fn has_meta(&self, hash: &ContentHash) -> Result<bool, StoreError>;
    fn get_meta(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(
        &self,
        kind: ChunkKind,
        hash: &ContentHash,
        bytes: &[u8],
        propagate: &[HostId],
    ) -> Result<Vec<StoreError>, StoreError> {
        match kind {
            ChunkKind::Data => self.put_data(hash, bytes, propagate),
            ChunkKind::Meta => self.put_meta(hash, bytes, propagate),
        }
    }

    fn has(&self, kind: ChunkKind, hash: &ContentHash) -> Result<bool, StoreError> {
        match kind {
            ChunkKind::Data => self.has_data(hash),
            ChunkKind::Meta => self.has_meta(hash),
        }
    }
}

/// Opens connections to hosts by id. Implementations must bound connection time.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str) -> Result<Arc<dyn ChunkStore>, StoreError>;
}

/// Server-side fan-out shared by the bundled backends: forward to every listed
/// host except `origin`, collecting per-host errors.
pub(crate) fn fan_out(
    connector: &dyn Connector,
    origin: &str,
    kind: ChunkKind,
    hash: &ContentHash,
    bytes: &[u8],
    propagate: &[HostId],
) -> Vec<StoreError> {
    let mut errors = Vec::new();
    for host in propagate.iter().filter(|h| h.as_str() != origin) {
        let res = connector.connect(host).and_then(|c| c.put(kind, hash, bytes, &[]));
        match res {
            Ok(mut nested) => errors.append(&mut nested),
            Err(e) => errors.push(e),
        }
    }
    errors
}
