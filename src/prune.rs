//! Drops round records that have fallen far behind the current round.
//!
//! Only the round store is touched. Progress belongs to the engine, so the
//! worker reads the current round from its handle and nothing more.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config;
use crate::engine::Handle;
use crate::store::{self, RoundStore};

pub struct Worker {
    cfg: config::Prune,
    rounds: Arc<dyn RoundStore>,
    engine: Handle,
}

impl Worker {
    pub fn new(cfg: config::Prune, rounds: Arc<dyn RoundStore>, engine: Handle) -> Self {
        Self { cfg, rounds, engine }
    }

    /// Prunes everything below `current - keep_rounds`, returning how many records went.
    pub async fn pass(&self) -> Result<usize, store::Error> {
        let below = self.engine.current_round() - self.cfg.keep_rounds;
        if below <= 0 {
            return Ok(0);
        }
        let pruned = self.rounds.prune_below(below).await?;
        debug!(below, pruned, "pruned round records");
        Ok(pruned)
    }

    pub async fn run(self, token: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.interval()) => {
                    match self.pass().await {
                        Ok(pruned) => info!(pruned, round = self.engine.current_round(), "prune pass done"),
                        Err(e) => error!(error = %e, "pruning round records failed"),
                    }
                }
            }
        }
        info!("pruning stopped");
    }
}
