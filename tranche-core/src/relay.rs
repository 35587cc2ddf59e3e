use crate::hash::ContentHash;
use crate::topology::HostId;

/// Decides which connected core hosts receive a chunk directly, and in which
/// order. Each relay is asked to fan the chunk out to the hosts still unconfirmed.
pub trait RelayPlanner: Send + Sync {
    fn plan(&self, hash: &ContentHash, connected: &[HostId]) -> Vec<HostId>;
}

/// Deterministic default: the connected hosts, sorted, rotated by the first
/// byte of the hash so load spreads across servers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RotatingPlanner;

impl RelayPlanner for RotatingPlanner {
    fn plan(&self, hash: &ContentHash, connected: &[HostId]) -> Vec<HostId> {
        if connected.is_empty() {
            return Vec::new();
        }
        let mut hosts = connected.to_vec();
        hosts.sort();
        hosts.dedup();
        let start = hash.as_bytes()[0] as usize % hosts.len();
        hosts.rotate_left(start);
        hosts
    }
}
