use std::collections::HashSet;
use std::net::SocketAddr;

use anyhow::{Result, ensure};

/// Peer addresses of every replica a coordinator fans requests out to.
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    replicas: Vec<SocketAddr>,
}

impl ReplicaSet {
    pub fn new(replicas: Vec<SocketAddr>) -> Result<Self> {
        ensure!(!replicas.is_empty(), "replica set requires at least one replica");
        let unique: HashSet<&SocketAddr> = replicas.iter().collect();
        ensure!(
            unique.len() == replicas.len(),
            "replica set contains duplicate addresses"
        );
        Ok(Self { replicas })
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.replicas.contains(addr)
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.replicas.len())
    }
}

/// Majority of `replicas`: `⌊N/2⌋ + 1`.
pub fn quorum_size(replicas: usize) -> usize {
    replicas / 2 + 1
}
