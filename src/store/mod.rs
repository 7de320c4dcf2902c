//! Durable block and round storage.
//!
//! Every block backend implements [`BlockStore`]; the composite and tiered
//! stores are themselves just more implementations fanning out to others.
//! Which one a node runs is picked once at startup from
//! [`config::Storage::provider`](crate::config::Storage).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{block, config};

pub mod fs;
pub mod http;
pub mod kv;
pub mod mem;
pub mod multi;
pub mod round;
pub mod tiered;

pub use round::RoundStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("block {0} not found")]
    NotFound(String),
    #[error("round {0} not found")]
    RoundNotFound(i64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("kv: {0}")]
    Kv(#[from] sled::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote store answered {0}")]
    Status(reqwest::StatusCode),
    #[error("{0} is not a block hash")]
    BadKey(String),
    #[error("stored block {stored} under key {key}")]
    Corrupt { key: String, stored: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::RoundNotFound(_))
    }
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn write(&self, b: &block::Block) -> Result<(), Error>;

    async fn read(&self, hash: &str, round: i64) -> Result<block::Block, Error>;

    async fn exists(&self, hash: &str) -> bool;

    async fn delete(&self, hash: &str, round: i64) -> Result<(), Error>;
}

/// Opens the block backend named by the configuration.
pub fn open(cfg: &config::Storage) -> Result<Arc<dyn BlockStore>, Error> {
    let store: Arc<dyn BlockStore> = match cfg.provider {
        config::Provider::Fs => Arc::new(fs::FsBlockStore::new(&cfg.blocks_dir)),
        config::Provider::Kv => Arc::new(kv::KvBlockStore::open(&cfg.blocks_db)?),
        config::Provider::Multi => Arc::new(multi::MultiBlockStore::new(vec![
            Arc::new(fs::FsBlockStore::new(&cfg.blocks_dir)),
            Arc::new(kv::KvBlockStore::open(&cfg.blocks_db)?),
        ])),
        config::Provider::Mem => Arc::new(mem::MemBlockStore::default()),
    };
    Ok(store)
}

/// Opens the round backend that goes with a block backend.
pub fn open_rounds(cfg: &config::Storage) -> Result<Arc<dyn RoundStore>, Error> {
    let store: Arc<dyn RoundStore> = match cfg.provider {
        config::Provider::Mem => Arc::new(round::MemRoundStore::default()),
        _ => Arc::new(round::KvRoundStore::open(&cfg.rounds_db)?),
    };
    Ok(store)
}

const SAVE_SAMPLES: usize = 1000;
const SAVE_WARMUP: usize = 100;

/// Running block save latency, used to flag unusually slow writes.
#[derive(Debug, Default)]
pub struct SaveTimer {
    samples: Mutex<VecDeque<Duration>>,
}

impl SaveTimer {
    /// Records a sample, returning the p95 it was compared to when it is
    /// more than twice as slow.
    pub fn record(&self, took: Duration) -> Option<Duration> {
        let mut samples = self.samples.lock();
        let slow = if samples.len() >= SAVE_WARMUP {
            let p95 = Self::p95(&samples);
            (took > p95 * 2).then_some(p95)
        } else {
            None
        };
        if samples.len() == SAVE_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(took);
        slow
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }

    fn p95(samples: &VecDeque<Duration>) -> Duration {
        let mut sorted: Vec<_> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() * 95) / 100).min(sorted.len() - 1);
        sorted[idx]
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::account;

    pub fn chain(n: i64) -> Vec<block::Block> {
        let miner = account::Keypair::gen();
        let mut prev = block::Block::genesis();
        let mut out = Vec::new();
        for _ in 0..n {
            let b = block::Builder::new(&prev).finalize(&miner);
            prev = b.clone();
            out.push(b);
        }
        out
    }

    /// Exercises the contract every backend must meet.
    pub async fn contract(store: &dyn BlockStore) {
        let blocks = chain(3);
        assert!(!store.exists(&blocks[0].hash).await);
        assert!(store.read(&blocks[0].hash, 1).await.unwrap_err().is_not_found());
        for b in &blocks {
            store.write(b).await.unwrap();
        }
        // rewrites are idempotent
        store.write(&blocks[1]).await.unwrap();
        for b in &blocks {
            assert!(store.exists(&b.hash).await);
            assert_eq!(&store.read(&b.hash, b.round).await.unwrap(), b);
        }
        store.delete(&blocks[2].hash, 3).await.unwrap();
        assert!(!store.exists(&blocks[2].hash).await);
        assert!(store.read(&blocks[2].hash, 3).await.unwrap_err().is_not_found());
    }

    #[test]
    fn save_timer() {
        let timer = SaveTimer::default();
        for _ in 0..SAVE_WARMUP {
            assert_eq!(timer.record(Duration::from_millis(10)), None);
        }
        assert_eq!(timer.record(Duration::from_millis(15)), None);
        assert_eq!(timer.record(Duration::from_millis(50)), Some(Duration::from_millis(10)));
        for _ in 0..SAVE_SAMPLES * 2 {
            timer.record(Duration::from_millis(1));
        }
        assert_eq!(timer.count(), SAVE_SAMPLES);
    }

    #[tokio::test]
    async fn open_mem() {
        let cfg = config::Storage { provider: config::Provider::Mem, ..Default::default() };
        let store = open(&cfg).unwrap();
        contract(store.as_ref()).await;
        let rounds = open_rounds(&cfg).unwrap();
        assert!(rounds.most_recent().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn open_multi() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config::Storage {
            provider: config::Provider::Multi,
            blocks_dir: dir.path().join("blocks"),
            blocks_db: dir.path().join("blocksdb"),
            rounds_db: dir.path().join("rounds"),
            ..Default::default()
        };
        let store = open(&cfg).unwrap();
        contract(store.as_ref()).await;
    }
}
