//! Which sharders keep which block bodies.
//!
//! Every sharder stores every round record, but a block body only lives on
//! `replication` sharders. They are picked by ranking the fleet on
//! `sha256(block hash ++ sharder id)`, so any node can work out the holders
//! of a block without asking anyone.

use sha2::{Digest, Sha256};

use crate::account;

#[derive(Debug, Clone)]
pub struct Sharding {
    self_id: account::NodeId,
    sharders: Vec<account::NodeId>,
    replication: usize,
}

impl Sharding {
    pub fn new(self_id: &str, sharders: impl IntoIterator<Item = account::NodeId>, replication: usize) -> Self {
        let mut sharders: Vec<_> = sharders.into_iter().collect();
        sharders.sort();
        sharders.dedup();
        Self { self_id: self_id.to_string(), sharders, replication }
    }

    /// Every block is stored here.
    pub fn all(self_id: &str) -> Self {
        Self::new(self_id, [self_id.to_string()], 0)
    }

    fn stores_everything(&self) -> bool {
        self.replication == 0 || self.replication >= self.sharders.len()
    }

    /// Sharders holding the block, best ranked first.
    pub fn block_sharders(&self, hash: &str) -> Vec<account::NodeId> {
        let mut ranked: Vec<([u8; 32], &account::NodeId)> = self
            .sharders
            .iter()
            .map(|id| {
                let mut hasher = Sha256::new();
                hasher.update(hash.as_bytes());
                hasher.update(id.as_bytes());
                (hasher.finalize().into(), id)
            })
            .collect();
        ranked.sort();
        let keep = if self.stores_everything() { ranked.len() } else { self.replication };
        ranked.into_iter().take(keep).map(|(_, id)| id.clone()).collect()
    }

    pub fn is_block_sharder(&self, hash: &str) -> bool {
        if self.stores_everything() {
            return true;
        }
        self.block_sharders(hash).contains(&self.self_id)
    }
}
