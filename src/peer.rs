//! Remote sharders and miners.
//!
//! The sync engine only sees the [`PeerSet`] contract: ask everybody, or ask
//! peers one at a time until an answer is acceptable. Both are best effort.
//! [`HttpPeerSet`] is the production implementation, talking to the routes
//! served by [`app`](crate::app) on other nodes and keeping a small health
//! record per peer so that dead peers stop being asked for a while.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::account;
use crate::config;
use crate::msg::{Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no active peers")]
    NoPeers,
    #[error("no peer gave an acceptable answer")]
    NoResponse,
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer answered {0}")]
    Status(StatusCode),
}

pub type Accept<'a> = &'a (dyn Fn(&Response) -> bool + Send + Sync);

#[async_trait]
pub trait PeerSet: Send + Sync {
    /// Sends the request to every active peer and keeps whatever came back.
    async fn request_from_all(&self, req: &Request) -> Vec<(account::NodeId, Response)>;

    /// Asks active peers in random order until one answer passes `accept`.
    async fn request_from_one(&self, req: &Request, accept: Accept<'_>) -> Result<Response, Error>;

    /// Refreshes peer liveness before the set is relied on.
    async fn status_monitor(&self) {}

    fn size(&self) -> usize;
}

#[derive(Debug, Clone)]
struct PeerState {
    peer: config::Peer,
    failures: u32,
    inactive_since: Option<Instant>,
}

pub struct HttpPeerSet {
    client: reqwest::Client,
    peers: RwLock<Vec<PeerState>>,
    max_failures: u32,
    retry_after: Duration,
}

impl HttpPeerSet {
    /// `self_id` is left out of the set so a node never asks itself.
    pub fn new(peers: &[config::Peer], self_id: &str, cfg: &config::Peers) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(cfg.timeout()).build()?;
        let peers = peers
            .iter()
            .filter(|p| p.id != self_id)
            .map(|p| PeerState { peer: p.clone(), failures: 0, inactive_since: None })
            .collect();
        Ok(Self {
            client,
            peers: RwLock::new(peers),
            max_failures: cfg.max_failures.max(1),
            retry_after: cfg.retry_after(),
        })
    }

    fn active(&self) -> Vec<config::Peer> {
        self.peers
            .read()
            .iter()
            .filter(|s| match s.inactive_since {
                None => true,
                Some(since) => since.elapsed() >= self.retry_after,
            })
            .map(|s| s.peer.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    fn mark(&self, id: &str, ok: bool) {
        let mut peers = self.peers.write();
        let Some(state) = peers.iter_mut().find(|s| s.peer.id == id) else { return };
        if ok {
            if state.inactive_since.take().is_some() {
                info!(peer = %id, "peer active again");
            }
            state.failures = 0;
        } else {
            state.failures += 1;
            if state.failures >= self.max_failures && state.inactive_since.is_none() {
                warn!(peer = %id, failures = state.failures, "peer marked inactive");
                state.inactive_since = Some(Instant::now());
            } else if state.inactive_since.is_some() {
                // still down after the back off, wait another round
                state.inactive_since = Some(Instant::now());
            }
        }
    }

    fn request_builder(&self, base: &str, req: &Request) -> reqwest::RequestBuilder {
        let base = base.trim_end_matches('/');
        match req {
            Request::LatestRound => self.client.get(format!("{}/v1/round/latest", base)),
            Request::LfbTicket => self.client.get(format!("{}/v1/lfb_ticket", base)),
            Request::Round { number } => self
                .client
                .get(format!("{}/v1/round/get", base))
                .query(&[("round", number)]),
            Request::Block { round } => self
                .client
                .get(format!("{}/v1/block/get", base))
                .query(&[("round", round)]),
            Request::BlockByHash { hash, round } => self
                .client
                .get(format!("{}/v1/block/get", base))
                .query(&[("hash", hash.clone()), ("round", round.to_string())]),
            Request::Phase => self.client.get(format!("{}/v1/phase", base)),
            Request::SharderKeepList => self.client.get(format!("{}/v1/sharder_keep", base)),
            Request::SubmitTxn { txn } => self
                .client
                .post(format!("{}/v1/transaction/put", base))
                .json(txn),
            Request::TxnConfirmation { hash } => self
                .client
                .get(format!("{}/v1/transaction/summary", base))
                .query(&[("hash", hash)]),
        }
    }

    async fn send(&self, peer: &config::Peer, req: &Request) -> Result<Response, Error> {
        let result = async {
            let resp = self.request_builder(&peer.url, req).send().await?;
            if !resp.status().is_success() {
                return Err(Error::Status(resp.status()));
            }
            Ok(resp.json::<Response>().await?)
        }
        .await;
        // a 404 is an answer, not a sign the peer is down
        let alive = match &result {
            Ok(_) => true,
            Err(Error::Status(s)) => s.is_client_error(),
            Err(_) => false,
        };
        self.mark(&peer.id, alive);
        if let Err(e) = &result {
            debug!(peer = %peer.id, request = ?req, error = %e, "peer request failed");
        }
        result
    }
}

#[async_trait]
impl PeerSet for HttpPeerSet {
    async fn request_from_all(&self, req: &Request) -> Vec<(account::NodeId, Response)> {
        let peers = self.active();
        let results = futures::future::join_all(peers.iter().map(|p| self.send(p, req))).await;
        peers
            .into_iter()
            .zip(results)
            .filter_map(|(p, res)| res.ok().map(|r| (p.id, r)))
            .collect()
    }

    async fn request_from_one(&self, req: &Request, accept: Accept<'_>) -> Result<Response, Error> {
        let mut peers = self.active();
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }
        peers.shuffle(&mut rand::thread_rng());
        for peer in &peers {
            match self.send(peer, req).await {
                Ok(resp) if accept(&resp) => return Ok(resp),
                Ok(_) => debug!(peer = %peer.id, request = ?req, "peer answer rejected"),
                Err(_) => {}
            }
        }
        Err(Error::NoResponse)
    }

    async fn status_monitor(&self) {
        let peers: Vec<_> = self.peers.read().iter().map(|s| s.peer.clone()).collect();
        let checks = peers.iter().map(|p| {
            let url = format!("{}/_health", p.url.trim_end_matches('/'));
            async move {
                let ok = matches!(self.client.get(url).send().await, Ok(r) if r.status().is_success());
                (p.id.clone(), ok)
            }
        });
        for (id, ok) in futures::future::join_all(checks).await {
            if ok {
                self.mark(&id, true);
            } else {
                // one sweep is enough to take a peer out
                for _ in 0..self.max_failures {
                    self.mark(&id, false);
                }
            }
        }
        info!(active = self.active_count(), total = self.size(), "peer status sweep done");
    }

    fn size(&self) -> usize {
        self.peers.read().len()
    }
}
