//! Startup catch-up with the sharder fleet.
//!
//! Runs once, on the engine task, before the sync loop starts. Rounds are
//! fetched and applied one at a time, so nothing here needs the ordering
//! machinery the live path uses.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{self, Engine, SharderStatus};
use crate::msg::{Request, Response};
use crate::peer::{self, PeerSet};
use crate::round::Round;
use crate::config;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fetching block: {0}")]
    Peer(#[from] peer::Error),
    #[error("applying block: {0}")]
    Apply(#[from] engine::Error),
}

/// Most advanced finalized round any sharder reports.
pub async fn latest_round(sharders: &dyn PeerSet) -> Option<Round> {
    sharders
        .request_from_all(&Request::LatestRound)
        .await
        .into_iter()
        .filter_map(|(_, r)| r.into_round())
        .filter(Round::is_valid)
        .max_by_key(|r| r.number)
}

impl Engine {
    /// Brings a restarted node level with the sharders, returning the round reached.
    pub async fn rejoin(&mut self, cfg: &config::Rejoin, token: &CancellationToken) -> i64 {
        self.deps.sharders.status_monitor().await;
        let local = self.current_round();
        let Some(latest) = latest_round(self.deps.sharders.as_ref()).await else {
            warn!(round = local, "no sharder reported a latest round, skipping rejoin");
            return local;
        };
        if latest.number <= local + 1 {
            info!(round = local, latest = latest.number, "in step with sharders");
            return local;
        }
        info!(round = local, latest = latest.number, "behind sharders, rejoining");
        self.set_sharder_status(SharderStatus::Syncing);
        let reached = self.get_missing_rounds(local + 1, latest.number, cfg, token).await;
        self.set_sharder_status(SharderStatus::Normal);
        info!(round = reached, latest = latest.number, "rejoin finished");
        reached
    }

    async fn get_missing_rounds(&mut self, from: i64, to: i64, cfg: &config::Rejoin, token: &CancellationToken) -> i64 {
        for round in from..=to {
            let mut attempt = 0;
            loop {
                if token.is_cancelled() {
                    return self.current_round();
                }
                match self.rejoin_round(round).await {
                    Ok(()) => break,
                    Err(e) => {
                        attempt += 1;
                        warn!(round, attempt, error = %e, "rejoin round failed");
                        if attempt > cfg.retries {
                            warn!(round, "leaving the remaining rounds to round sync");
                            return self.current_round();
                        }
                        tokio::select! {
                            _ = token.cancelled() => return self.current_round(),
                            _ = tokio::time::sleep(cfg.retry_delay()) => {}
                        }
                    }
                }
            }
        }
        self.current_round()
    }

    // storage failures are retried here, whatever the live durability policy
    async fn rejoin_round(&mut self, round: i64) -> Result<(), Error> {
        let accept = move |r: &Response| matches!(r, Response::Block(b) if b.round == round && b.validate().is_ok());
        let resp = self
            .deps
            .sharders
            .request_from_one(&Request::Block { round }, &accept)
            .await?;
        let b = resp.into_block().ok_or(peer::Error::NoResponse)?;
        self.apply(b, true).await?;
        Ok(())
    }
}
