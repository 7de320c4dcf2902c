//! Background re-verification of stored rounds.
//!
//! A deep scanner walks the whole local history a batch at a time; a
//! proximity scanner keeps re-reading the last few rounds. Neither writes to
//! the stores. When a round can't be read back or doesn't match its block,
//! the scanner records it, asks the engine to repair it and stays on it
//! until it reads back clean.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::engine::{self, Handle};
use crate::shard::Sharding;
use crate::store::{self, BlockStore, RoundStore};
use crate::{block, config};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage: {0}")]
    Store(#[from] store::Error),
    #[error("round {0} is not finalized")]
    InvalidRound(i64),
    #[error("round {round} names {hash} but the stored block differs")]
    Mismatch { round: i64, hash: String },
    #[error("block {0} missing from storage")]
    Missing(String),
    #[error("stored block: {0}")]
    Block(#[from] block::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Deep,
    Proximity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub mode: Mode,
    pub cycles: u64,
    pub checked: u64,
    /// Next round the scanner will look at.
    pub progress: i64,
    pub first_bad: Option<i64>,
    pub last_scan: Option<DateTime<Utc>>,
}

impl Report {
    fn new(mode: Mode) -> Self {
        Self { mode, cycles: 0, checked: 0, progress: 1, first_bad: None, last_scan: None }
    }
}

/// Latest report of every scanner, shared with the status endpoint.
#[derive(Debug, Default)]
pub struct Reports {
    inner: RwLock<HashMap<Mode, Report>>,
}

impl Reports {
    pub fn get(&self, mode: Mode) -> Option<Report> {
        self.inner.read().get(&mode).cloned()
    }

    pub fn snapshot(&self) -> Vec<Report> {
        let mut all: Vec<_> = self.inner.read().values().cloned().collect();
        all.sort_by_key(|r| r.mode == Mode::Proximity);
        all
    }

    fn set(&self, report: Report) {
        self.inner.write().insert(report.mode, report);
    }
}

pub struct Scanner {
    mode: Mode,
    cfg: config::Scan,
    blocks: Arc<dyn BlockStore>,
    rounds: Arc<dyn RoundStore>,
    cache: Arc<Cache>,
    sharding: Arc<Sharding>,
    engine: Handle,
    reports: Arc<Reports>,
    report: Report,
}

impl Scanner {
    pub fn new(mode: Mode, cfg: config::Scan, deps: &engine::Deps, engine: Handle, reports: Arc<Reports>) -> Self {
        let report = Report::new(mode);
        reports.set(report.clone());
        Self {
            mode,
            cfg,
            blocks: deps.blocks.clone(),
            rounds: deps.rounds.clone(),
            cache: deps.cache.clone(),
            sharding: deps.sharding.clone(),
            engine,
            reports,
            report,
        }
    }

    /// Reads one round back and checks it against its block.
    pub async fn check_round(&self, number: i64) -> Result<(), Error> {
        let r = self.rounds.get(number).await?;
        if !r.is_valid() {
            return Err(Error::InvalidRound(number));
        }
        if !self.sharding.is_block_sharder(&r.block_hash) {
            return Ok(());
        }
        // a cached copy was verified on the way in, storage only has to still hold it
        let (b, cached) = match self.cache.block(&r.block_hash) {
            Some(b) => {
                if !self.blocks.exists(&r.block_hash).await {
                    return Err(Error::Missing(r.block_hash));
                }
                (b.as_ref().clone(), true)
            }
            None => (self.blocks.read(&r.block_hash, number).await?, false),
        };
        if b.round != number || b.hash != r.block_hash {
            return Err(Error::Mismatch { round: number, hash: r.block_hash });
        }
        if !cached {
            b.validate()?;
        }
        Ok(())
    }

    // pruned rounds are gone for good, scans start above them
    async fn floor(&self) -> i64 {
        self.rounds.oldest().await.map(|r| r.number).unwrap_or(1).max(1)
    }

    /// Scans one batch, returning the first bad round found.
    pub async fn scan(&mut self) -> Option<i64> {
        let current = self.engine.current_round();
        let floor = self.floor().await;
        let from = match self.mode {
            Mode::Deep => {
                if self.report.progress > current {
                    self.report.cycles += 1;
                    self.report.progress = floor;
                    self.report.first_bad = None;
                    info!(mode = ?self.mode, cycles = self.report.cycles, "health scan cycle complete");
                }
                self.report.progress.max(floor)
            }
            Mode::Proximity => self.report.progress.max(current - self.cfg.window + 1).max(floor),
        };
        let to = (from + self.cfg.batch_size.max(1) - 1).min(current);

        let mut bad = None;
        let mut checked = 0;
        for number in from..=to {
            checked += 1;
            if let Err(e) = self.check_round(number).await {
                warn!(mode = ?self.mode, round = number, error = %e, "health check failed");
                bad = Some(number);
                break;
            }
        }
        self.report.checked += checked;
        self.report.last_scan = Some(Utc::now());
        match bad {
            Some(number) => {
                if self.report.first_bad.is_none() {
                    self.report.first_bad = Some(number);
                }
                self.report.progress = number;
                if let Err(e) = self.engine.request_repair(number).await {
                    warn!(round = number, error = %e, "could not request repair");
                }
            }
            None => {
                self.report.progress = match self.mode {
                    Mode::Deep => to.max(from - 1) + 1,
                    // proximity always goes back to the window start
                    Mode::Proximity => 1,
                };
                if self.mode == Mode::Proximity {
                    self.report.first_bad = None;
                }
            }
        }
        self.reports.set(self.report.clone());
        debug!(mode = ?self.mode, from, to, checked, ?bad, "health scan");
        bad
    }

    pub async fn run(mut self, token: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.interval()) => {
                    self.scan().await;
                }
            }
        }
        info!(mode = ?self.mode, "health scanner stopped");
    }
}
