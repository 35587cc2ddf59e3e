use crate::hash::{ContentHash, HashSpan};
use serde::{Deserialize, Serialize};

pub type HostId = String;

fn yes() -> bool {
    true
}

/// One known storage server and the attributes the upload pipeline routes on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: HostId,
    #[serde(default = "yes")]
    pub writable: bool,
    #[serde(default = "yes")]
    pub online: bool,
    #[serde(default)]
    pub core: bool,
    #[serde(default)]
    pub spans: Vec<HashSpan>,
}

impl ServerInfo {
    pub fn core(host: &str) -> Self {
        Self {
            host: host.to_string(),
            writable: true,
            online: true,
            core: true,
            spans: vec![HashSpan::full()],
        }
    }

    pub fn covers(&self, hash: &ContentHash) -> bool {
        self.spans.iter().any(|s| s.contains(hash))
    }

    pub fn is_usable_core(&self) -> bool {
        self.writable && self.online && self.core && !self.spans.is_empty()
    }
}

/// Current view of the network.
pub trait Topology: Send + Sync {
    fn servers(&self) -> Vec<ServerInfo>;
}

/// Hosts a single chunk must be written to, split by replication tier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostTiers {
    pub core: Vec<HostId>,
    pub non_core: Vec<HostId>,
}

impl HostTiers {
    pub fn is_empty(&self) -> bool {
        self.core.is_empty() && self.non_core.is_empty()
    }
}

/// Which servers the caller allows, and which ones it pins ("sticky").
#[derive(Clone, Debug, Default)]
pub struct ServerSelection {
    pub selected: Vec<HostId>,
    pub sticky: Vec<HostId>,
}

impl ServerSelection {
    pub fn admits(&self, host: &str) -> bool {
        self.selected.is_empty()
            || self.selected.iter().any(|h| h == host)
            || self.is_sticky(host)
    }

    pub fn is_sticky(&self, host: &str) -> bool {
        self.sticky.iter().any(|h| h == host)
    }

    /// Split the admitted servers into the core and non-core tiers for `hash`.
    /// Sticky servers always land in the core tier when writable and online.
    pub fn tiers(&self, servers: &[ServerInfo], hash: &ContentHash) -> HostTiers {
        let mut tiers = HostTiers::default();
        for s in servers {
            if !self.admits(&s.host) || !s.writable || !s.online {
                continue;
            }
            let sticky = self.is_sticky(&s.host);
            let covers = s.covers(hash);
            if sticky || (s.core && covers) {
                tiers.core.push(s.host.clone());
            } else if covers {
                tiers.non_core.push(s.host.clone());
            }
        }
        tiers
    }
}
