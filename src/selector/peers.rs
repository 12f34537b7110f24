use std::collections::HashMap;

use ipnet::IpNet;
use parking_lot::RwLock;

/// An established peering connection of a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Addresses reachable through the peer
    pub addresses: Vec<IpNet>,
}

/// Source of network peering state.
pub trait PeerTopology: Send + Sync {
    /// The named peer of `network`, if the connection is established
    fn peer(&self, network: &str, peer: &str) -> Option<PeerInfo>;
}

/// In-memory peer topology
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<(String, String), PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an established peer connection
    pub fn establish(&self, network: impl Into<String>, peer: impl Into<String>, addresses: Vec<IpNet>) {
        self.peers
            .write()
            .insert((network.into(), peer.into()), PeerInfo { addresses });
    }

    /// Forget a peer connection. Returns whether it existed.
    pub fn teardown(&self, network: &str, peer: &str) -> bool {
        self.peers
            .write()
            .remove(&(network.to_string(), peer.to_string()))
            .is_some()
    }
}

impl PeerTopology for PeerTable {
    fn peer(&self, network: &str, peer: &str) -> Option<PeerInfo> {
        self.peers
            .read()
            .get(&(network.to_string(), peer.to_string()))
            .cloned()
    }
}
