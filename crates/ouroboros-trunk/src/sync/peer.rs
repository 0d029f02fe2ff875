//! Peer storage node descriptors

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::config::PeerConfig;

/// Membership status of a peer storage node, as reported by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    None,
    Init,
    WaitSync,
    Syncing,
    IpChanged,
    Deleted,
    Offline,
    Online,
    Active,
    Recovery,
}

impl PeerStatus {
    /// A peer in one of these states is gone for good; its sync task exits
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerStatus::Deleted | PeerStatus::IpChanged | PeerStatus::None
        )
    }
}

/// A peer the trunk binlog is replicated to.
///
/// Address and status are updated in place by membership changes while a
/// sync task holds the peer.
#[derive(Debug)]
pub struct StoragePeer {
    id: String,
    ip_addr: RwLock<String>,
    status: RwLock<PeerStatus>,
}

impl StoragePeer {
    pub fn new(id: impl Into<String>, ip_addr: impl Into<String>, status: PeerStatus) -> Self {
        Self {
            id: id.into(),
            ip_addr: RwLock::new(ip_addr.into()),
            status: RwLock::new(status),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ip_addr(&self) -> String {
        self.ip_addr.read().clone()
    }

    pub fn set_ip_addr(&self, ip_addr: impl Into<String>) {
        *self.ip_addr.write() = ip_addr.into();
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: PeerStatus) {
        *self.status.write() = status;
    }
}

impl From<&PeerConfig> for StoragePeer {
    fn from(config: &PeerConfig) -> Self {
        StoragePeer::new(config.id.clone(), config.ip_addr.clone(), config.status)
    }
}

/// Addresses this node is reachable on
#[derive(Debug, Default)]
pub struct LocalHost {
    ips: RwLock<HashSet<String>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with addresses known at startup
    pub fn with_ips<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ips: RwLock::new(ips.into_iter().map(Into::into).collect()),
        }
    }

    /// Record an address; returns false if it was already known
    pub fn insert(&self, ip: IpAddr) -> bool {
        let ip = ip.to_string();
        if self.ips.read().contains(&ip) {
            return false;
        }
        self.ips.write().insert(ip)
    }

    pub fn is_local_host_ip(&self, ip: &str) -> bool {
        self.ips.read().contains(ip)
    }
}
