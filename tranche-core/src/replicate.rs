//! Two-tier replication shared by the data and metadata uploaders.
//!
//! Core tier: relay through the planner's hosts, fanning out to the hosts not
//! yet confirmed, and re-verify presence after every relay until the
//! replication factor is met. Non-core tier: direct write and verify on every
//! host, all of which must succeed.

use crate::control::Control;
use crate::error::{StoreError, UploadError};
use crate::hash::ContentHash;
use crate::model::MetadataRecord;
use crate::net::{ChunkKind, ChunkStore, Connector};
use crate::relay::RelayPlanner;
use crate::topology::{HostId, HostTiers, ServerSelection, Topology};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hosts that confirmed a chunk, plus the per-host errors recovered along the way.
#[derive(Debug, Default)]
pub struct Replicated {
    pub core: Vec<HostId>,
    pub non_core: Vec<HostId>,
    pub host_errors: Vec<StoreError>,
}

pub struct Replicator {
    pub topology: Arc<dyn Topology>,
    pub connector: Arc<dyn Connector>,
    pub planner: Arc<dyn RelayPlanner>,
    pub selection: ServerSelection,
    pub replication_factor: usize,
    pub control: Arc<Control>,
}

impl Replicator {
    pub fn tiers(&self, hash: &ContentHash) -> HostTiers {
        self.selection.tiers(&self.topology.servers(), hash)
    }

    fn connect_all(
        &self,
        hosts: &[HostId],
        errors: &mut Vec<StoreError>,
    ) -> Result<BTreeMap<HostId, Arc<dyn ChunkStore>>, UploadError> {
        let mut conns = BTreeMap::new();
        for h in hosts {
            if self.control.should_halt() {
                return Err(UploadError::Halted);
            }
            match self.connector.connect(h) {
                Ok(c) => {
                    conns.insert(h.clone(), c);
                }
                Err(e) => {
                    warn!(host = %h, error = %e, "core host unavailable");
                    errors.push(e);
                }
            }
        }
        Ok(conns)
    }

    pub fn replicate(
        &self,
        kind: ChunkKind,
        hash: &ContentHash,
        bytes: &[u8],
    ) -> Result<Replicated, UploadError> {
        let tiers = self.tiers(hash);
        if tiers.is_empty() {
            return Err(UploadError::NoHosts(*hash));
        }
        let mut errors = Vec::new();
        let conns = self.connect_all(&tiers.core, &mut errors)?;
        let connected: Vec<HostId> = conns.keys().cloned().collect();
        let required = self.replication_factor;
        let mut confirmed: BTreeSet<HostId> = BTreeSet::new();

        for relay in self.planner.plan(hash, &connected) {
            if confirmed.len() >= required || confirmed.len() == connected.len() {
                break;
            }
            if self.control.should_halt() {
                return Err(UploadError::Halted);
            }
            let Some(conn) = conns.get(&relay) else { continue };
            if confirmed.contains(&relay) {
                continue;
            }
            let targets: Vec<HostId> = connected
                .iter()
                .filter(|h| **h != relay && !confirmed.contains(*h))
                .cloned()
                .collect();
            match conn.put(kind, hash, bytes, &targets) {
                Ok(fanout_errors) => {
                    for e in fanout_errors {
                        warn!(relay = %relay, error = %e, "propagation failed");
                        errors.push(e);
                    }
                }
                Err(e) => {
                    warn!(relay = %relay, error = %e, "relay write failed");
                    errors.push(e);
                }
            }
            for (h, c) in &conns {
                if confirmed.contains(h) {
                    continue;
                }
                match c.has(kind, hash) {
                    Ok(true) => {
                        confirmed.insert(h.clone());
                    }
                    Ok(false) => debug!(host = %h, hash = %hash.short(), "not yet present"),
                    Err(e) => errors.push(e),
                }
            }
        }

        if confirmed.len() < required {
            return Err(UploadError::InsufficientReplicas {
                hash: *hash,
                confirmed: confirmed.len(),
                required,
            });
        }

        let mut non_core = Vec::with_capacity(tiers.non_core.len());
        for h in &tiers.non_core {
            if self.control.should_halt() {
                return Err(UploadError::Halted);
            }
            let fail = |reason: String| UploadError::NonCoreFailed {
                host: h.clone(),
                hash: *hash,
                reason,
            };
            let conn = self.connector.connect(h).map_err(|e| fail(e.to_string()))?;
            conn.put(kind, hash, bytes, &[]).map_err(|e| fail(e.to_string()))?;
            if !conn.has(kind, hash).map_err(|e| fail(e.to_string()))? {
                return Err(fail("chunk missing after write".into()));
            }
            non_core.push(h.clone());
        }

        debug!(
            hash = %hash.short(),
            ?kind,
            core = confirmed.len(),
            non_core = non_core.len(),
            "replicated"
        );
        Ok(Replicated { core: confirmed.into_iter().collect(), non_core, host_errors: errors })
    }

    /// Merge every copy of a metadata record currently held by the core hosts.
    /// Unreadable copies are logged and skipped.
    pub fn existing_meta(&self, hash: &ContentHash) -> Result<Option<MetadataRecord>, UploadError> {
        let tiers = self.tiers(hash);
        let mut errors = Vec::new();
        let conns = self.connect_all(&tiers.core, &mut errors)?;
        let mut merged: Option<MetadataRecord> = None;
        for (h, c) in conns {
            let bytes = match c.get_meta(hash) {
                Ok(Some(b)) => b,
                Ok(None) => continue,
                Err(e) => {
                    warn!(host = %h, error = %e, "metadata fetch failed");
                    continue;
                }
            };
            match MetadataRecord::from_bytes(&bytes) {
                Ok(rec) => match merged.as_mut() {
                    Some(m) => {
                        m.merge(&rec);
                    }
                    None => merged = Some(rec),
                },
                Err(e) => warn!(host = %h, error = %e, "ignoring undecodable metadata"),
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::MemoryNetwork;
    use crate::relay::RotatingPlanner;
    use crate::topology::ServerInfo;
    use std::time::Duration;

    fn replicator(net: &MemoryNetwork, rf: usize) -> Replicator {
        Replicator {
            topology: Arc::new(net.clone()),
            connector: Arc::new(net.clone()),
            planner: Arc::new(RotatingPlanner),
            selection: ServerSelection::default(),
            replication_factor: rf,
            control: Arc::new(Control::new(Duration::from_millis(1))),
        }
    }

    #[test]
    fn replicates_to_all_core_hosts_via_fan_out() {
        let net = MemoryNetwork::with_core_servers(3);
        let h = ContentHash::of(b"data");
        let out = replicator(&net, 2).replicate(ChunkKind::Data, &h, b"data").unwrap();
        assert_eq!(out.core.len(), 3);
        assert_eq!(net.data_holders(&h).len(), 3);
        // one direct put, two forwarded
        assert_eq!(net.total_put_calls(), 3);
    }

    #[test]
    fn lying_host_is_tolerated_while_factor_is_met() {
        let net = MemoryNetwork::with_core_servers(3);
        net.server("core-1").unwrap().set_deny_has(true);
        let h = ContentHash::of(b"liar");
        let out = replicator(&net, 2).replicate(ChunkKind::Data, &h, b"liar").unwrap();
        assert_eq!(out.core.len(), 2);
        assert!(!out.core.contains(&"core-1".to_string()));
    }

    #[test]
    fn too_few_core_hosts_fails() {
        let net = MemoryNetwork::with_core_servers(2);
        net.server("core-0").unwrap().set_unreachable(true);
        let h = ContentHash::of(b"x");
        let err = replicator(&net, 2).replicate(ChunkKind::Data, &h, b"x").unwrap_err();
        assert!(matches!(err, UploadError::InsufficientReplicas { confirmed: 1, required: 2, .. }));
    }

    #[test]
    fn no_covering_hosts_fails_fast() {
        let net = MemoryNetwork::new();
        let mut s = ServerInfo::core("empty");
        s.spans.clear();
        net.add_server(s);
        let h = ContentHash::of(b"x");
        let err = replicator(&net, 1).replicate(ChunkKind::Data, &h, b"x").unwrap_err();
        assert!(matches!(err, UploadError::NoHosts(_)));
        assert_eq!(net.total_put_calls(), 0);
    }

    #[test]
    fn non_core_hosts_must_all_succeed() {
        let net = MemoryNetwork::with_core_servers(1);
        let mut edge = ServerInfo::core("edge");
        edge.core = false;
        let edge = net.add_server(edge);
        let h = ContentHash::of(b"nc");
        let r = replicator(&net, 1);
        let out = r.replicate(ChunkKind::Meta, &h, b"nc").unwrap();
        assert_eq!(out.non_core, vec!["edge".to_string()]);
        edge.set_reject_puts(true);
        let h2 = ContentHash::of(b"nc2");
        let err = r.replicate(ChunkKind::Meta, &h2, b"nc2").unwrap_err();
        assert!(matches!(err, UploadError::NonCoreFailed { .. }));
    }

    #[test]
    fn halted_replicator_issues_no_writes() {
        let net = MemoryNetwork::with_core_servers(2);
        let r = replicator(&net, 1);
        r.control.stop();
        let h = ContentHash::of(b"s");
        assert!(matches!(r.replicate(ChunkKind::Data, &h, b"s"), Err(UploadError::Halted)));
        assert_eq!(net.total_put_calls(), 0);
    }
}
