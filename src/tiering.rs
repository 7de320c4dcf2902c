//! Moves old blocks from local storage into the cold tier.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config;
use crate::engine::Handle;
use crate::shard::Sharding;
use crate::store::tiered::TieredBlockStore;
use crate::store::RoundStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_blocks_uploaded: u64,
    pub last_round_uploaded: Option<i64>,
    pub last_upload_time: Option<DateTime<Utc>>,
}

/// What one pass looked at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pass {
    pub scanned: u64,
    pub uploaded: u64,
    pub failed: u64,
    /// Round whose block was already in the cold tier, ending the walk.
    pub stopped_at: Option<i64>,
}

pub struct Worker {
    cfg: config::Tiering,
    store: Arc<TieredBlockStore>,
    rounds: Arc<dyn RoundStore>,
    sharding: Arc<Sharding>,
    engine: Handle,
    stats: Arc<RwLock<Stats>>,
}

impl Worker {
    pub fn new(
        cfg: config::Tiering,
        store: Arc<TieredBlockStore>,
        rounds: Arc<dyn RoundStore>,
        sharding: Arc<Sharding>,
        engine: Handle,
    ) -> Self {
        Self { cfg, store, rounds, sharding, engine, stats: Arc::default() }
    }

    pub fn stats(&self) -> Arc<RwLock<Stats>> {
        self.stats.clone()
    }

    /// Walks back from `current - old_block_round_range` until a block is
    /// found already migrated, uploading everything newer.
    pub async fn pass(&self) -> Pass {
        let mut pass = Pass::default();
        let permits = Arc::new(Semaphore::new(self.cfg.num_workers.max(1)));
        let mut uploads = JoinSet::new();
        let mut round = self.engine.current_round() - self.cfg.old_block_round_range;
        let floor = self.rounds.oldest().await.map(|r| r.number).unwrap_or(0).max(1);
        while round >= floor {
            pass.scanned += 1;
            let hash = match self.rounds.block_hash(round).await {
                Ok(hash) => hash,
                Err(e) => {
                    error!(round, error = %e, "no block hash for round");
                    round -= 1;
                    continue;
                }
            };
            if !self.sharding.is_block_sharder(&hash) {
                round -= 1;
                continue;
            }
            if self.store.cold_exists(&hash).await {
                info!(round, "block already in cold storage, stopping");
                pass.stopped_at = Some(round);
                break;
            }
            let Ok(permit) = permits.clone().acquire_owned().await else { break };
            let store = self.store.clone();
            uploads.spawn(async move {
                let _permit = permit;
                let res = store.upload(&hash, round).await;
                (round, res)
            });
            round -= 1;
        }

        while let Some(res) = uploads.join_next().await {
            let Ok((round, res)) = res else { continue };
            match res {
                Ok(()) => {
                    debug!(round, "block uploaded to cold storage");
                    pass.uploaded += 1;
                    let mut stats = self.stats.write();
                    stats.total_blocks_uploaded += 1;
                    stats.last_round_uploaded = Some(round);
                    stats.last_upload_time = Some(Utc::now());
                }
                Err(e) => {
                    error!(round, error = %e, "uploading block to cold storage failed");
                    pass.failed += 1;
                }
            }
        }
        pass
    }

    pub async fn run(self, token: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.interval()) => {
                    let pass = self.pass().await;
                    info!(scanned = pass.scanned, uploaded = pass.uploaded, failed = pass.failed, "tiering pass done");
                }
            }
        }
        info!("tiering stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{cfg, setup};
    use crate::engine::Engine;
    use crate::store::mem::MemBlockStore;
    use crate::store::BlockStore;

    #[tokio::test]
    async fn stops_at_migrated_round() {
        let mut s = setup(1000);
        let cold = Arc::new(MemBlockStore::default());
        let tiered = Arc::new(TieredBlockStore::new(s.blocks.clone(), cold.clone(), true));
        s.deps.blocks = tiered.clone();
        let (mut engine, handle) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        assert_eq!(handle.current_round(), 1000);
        cold.write(&s.chain[479]).await.unwrap();

        let tiering = config::Tiering { enabled: true, old_block_round_range: 500, num_workers: 4, ..Default::default() };
        let worker = Worker::new(tiering, tiered.clone(), s.deps.rounds.clone(), s.deps.sharding.clone(), handle);
        let pass = worker.pass().await;
        assert_eq!(pass.stopped_at, Some(480));
        assert_eq!(pass.scanned, 21);
        assert_eq!(pass.uploaded, 20);
        for b in &s.chain[480..500] {
            assert!(cold.exists(&b.hash).await);
            assert!(!s.blocks.exists(&b.hash).await);
        }
        // nothing below the migrated round was touched
        assert!(!cold.exists(&s.chain[478].hash).await);
        assert!(s.blocks.exists(&s.chain[478].hash).await);
        assert!(s.blocks.exists(&s.chain[500].hash).await);

        let stats = worker.stats().read().clone();
        assert_eq!(stats.total_blocks_uploaded, 20);
        assert!(stats.last_round_uploaded.is_some());
        assert!(stats.last_upload_time.is_some());

        // uploaded blocks still read through the tiered store
        assert_eq!(tiered.read(&s.chain[489].hash, 490).await.unwrap(), s.chain[489]);
        // a second pass stops right away
        assert_eq!(worker.pass().await.stopped_at, Some(500));
    }

    #[tokio::test]
    async fn upload_failures_are_counted() {
        let mut s = setup(5);
        let cold = Arc::new(MemBlockStore::default());
        let tiered = Arc::new(TieredBlockStore::new(s.blocks.clone(), cold.clone(), false));
        s.deps.blocks = tiered.clone();
        let (mut engine, handle) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        s.blocks.delete(&s.chain[1].hash, 2).await.unwrap();
        let tiering = config::Tiering { enabled: true, old_block_round_range: 2, ..Default::default() };
        let worker = Worker::new(tiering, tiered, s.deps.rounds.clone(), s.deps.sharding.clone(), handle);
        let pass = worker.pass().await;
        assert_eq!(pass.scanned, 3);
        assert_eq!(pass.uploaded, 2);
        assert_eq!(pass.failed, 1);
        assert_eq!(pass.stopped_at, None);
        // local copies are kept when not configured to delete them
        assert!(s.blocks.exists(&s.chain[2].hash).await);
    }

    #[tokio::test]
    async fn starts_above_pruned_rounds() {
        let mut s = setup(10);
        let cold = Arc::new(MemBlockStore::default());
        let tiered = Arc::new(TieredBlockStore::new(s.blocks.clone(), cold.clone(), false));
        s.deps.blocks = tiered.clone();
        let (mut engine, handle) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        assert_eq!(s.deps.rounds.prune_below(4).await.unwrap(), 4);
        let tiering = config::Tiering { enabled: true, old_block_round_range: 2, ..Default::default() };
        let worker = Worker::new(tiering, tiered, s.deps.rounds.clone(), s.deps.sharding.clone(), handle);
        let pass = worker.pass().await;
        // rounds 8 down to 4, nothing below the oldest record
        assert_eq!(pass.scanned, 5);
        assert_eq!(pass.uploaded, 5);
        assert!(!cold.exists(&s.chain[2].hash).await);
    }
}
