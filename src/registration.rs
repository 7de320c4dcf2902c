//! Keeps this sharder on the sharder-keep list and pings the miners.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::msg::phase;
use crate::msg::{Request, Response};
use crate::peer::{self, PeerSet};
use crate::{account, config, txn};

pub const SHARDER_KEEP: &str = "sharder_keep";
pub const SHARDER_HEALTH_CHECK: &str = "sharder_health_check";

const CONFIRM_ATTEMPTS: u32 = 10;
const CONFIRM_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peers: {0}")]
    Peer(#[from] peer::Error),
    #[error("no miner accepted transaction {0}")]
    NotAccepted(String),
    #[error("transaction {0} was not confirmed")]
    Unconfirmed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Phase older than one already handled.
    Stale,
    /// Not the contribute phase.
    Waiting,
    /// Already on the keep list.
    Listed,
    Registered,
}

pub struct Worker {
    cfg: config::Registration,
    kp: Arc<account::Keypair>,
    sharders: Arc<dyn PeerSet>,
    miners: Arc<dyn PeerSet>,
    phase_round: i64,
    accepted: Option<i64>,
}

impl Worker {
    pub fn new(
        cfg: config::Registration,
        kp: Arc<account::Keypair>,
        sharders: Arc<dyn PeerSet>,
        miners: Arc<dyn PeerSet>,
    ) -> Self {
        Self { cfg, kp, sharders, miners, phase_round: 0, accepted: None }
    }

    async fn phase(&self) -> Result<phase::Phase, Error> {
        let accept = |r: &Response| matches!(r, Response::Phase(_));
        match self.sharders.request_from_one(&Request::Phase, &accept).await? {
            Response::Phase(p) => Ok(p),
            _ => Err(peer::Error::NoResponse.into()),
        }
    }

    async fn is_listed(&self) -> Result<bool, Error> {
        let accept = |r: &Response| matches!(r, Response::Members(_));
        let id = self.kp.id();
        match self.sharders.request_from_one(&Request::SharderKeepList, &accept).await? {
            Response::Members(members) => Ok(members.contains(&id)),
            _ => Err(peer::Error::NoResponse.into()),
        }
    }

    async fn submit(&self, t: txn::Txn) -> Result<txn::Txn, Error> {
        let accepted = self
            .miners
            .request_from_all(&Request::SubmitTxn { txn: t.clone() })
            .await
            .into_iter()
            .any(|(_, r)| r == Response::Accepted);
        if !accepted {
            return Err(Error::NotAccepted(t.hash));
        }
        Ok(t)
    }

    async fn confirm(&self, t: &txn::Txn) -> Result<txn::Summary, Error> {
        let hash = t.hash.clone();
        let accept = move |r: &Response| matches!(r, Response::Confirmation(s) if s.hash == hash);
        let req = Request::TxnConfirmation { hash: t.hash.clone() };
        for attempt in 1..=CONFIRM_ATTEMPTS {
            if let Ok(Response::Confirmation(summary)) = self.sharders.request_from_one(&req, &accept).await {
                return Ok(summary);
            }
            debug!(hash = %t.hash, attempt, "transaction not confirmed yet");
            tokio::time::sleep(CONFIRM_DELAY).await;
        }
        Err(Error::Unconfirmed(t.hash.clone()))
    }

    /// One registration attempt against the current phase.
    pub async fn tick(&mut self) -> Result<Outcome, Error> {
        let p = self.phase().await?;
        if p.start_round < self.phase_round {
            return Ok(Outcome::Stale);
        }
        if p.phase != phase::Kind::Contribute {
            self.phase_round = p.start_round;
            return Ok(Outcome::Waiting);
        }
        if self.accepted == Some(p.start_round) {
            return Ok(Outcome::Registered);
        }
        if self.is_listed().await? {
            self.phase_round = p.start_round;
            self.accepted = Some(p.start_round);
            return Ok(Outcome::Listed);
        }

        debug!(start_round = p.start_round, "registering on the sharder keep list");
        let input = serde_json::json!({ "id": self.kp.id(), "public_key": self.kp.public_hex() });
        let t = txn::Txn::smart_contract(&self.kp, txn::MINER_SC_ADDRESS, SHARDER_KEEP, input);
        let t = self.submit(t).await?;
        let summary = self.confirm(&t).await?;
        info!(start_round = p.start_round, round = summary.round, hash = %t.hash, "registered on the sharder keep list");
        self.phase_round = p.start_round;
        self.accepted = Some(p.start_round);
        Ok(Outcome::Registered)
    }

    pub async fn health_ping(&self) -> Result<(), Error> {
        let t = txn::Txn::smart_contract(&self.kp, txn::MINER_SC_ADDRESS, SHARDER_HEALTH_CHECK, serde_json::Value::Null);
        self.submit(t).await?;
        Ok(())
    }

    pub async fn run(mut self, token: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        let mut repeat = tokio::time::interval(self.cfg.repeat().max(Duration::from_secs(1)));
        let mut ping = tokio::time::interval(self.cfg.health_ping_interval().max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = repeat.tick() => {
                    match self.tick().await {
                        Ok(outcome) => debug!(?outcome, "sharder keep"),
                        Err(e) => warn!(error = %e, "register sharder keep failed"),
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = self.health_ping().await {
                        warn!(error = %e, "sharder health check failed, trying again later");
                    }
                }
            }
        }
        info!("registration stopped");
    }
}
