//! Round synchronization.
//!
//! The [`Engine`] is the only writer of round progress. It runs as one task
//! that owns the current round and every in-memory [`Round`], and receives
//! work through a bounded channel: blocks handed over by the network layer,
//! blocks fetched by its own catch-up batches, and repair requests from the
//! health checker. Everything else observes progress through a [`Handle`].
//!
//! Catch-up runs in batches. On every timer tick (or when live traffic shows
//! a gap) the engine asks the sharders for their latest finalized round and
//! fetches up to `max_batch` missing rounds concurrently. Only the contiguous
//! prefix of a batch is fed back into the channel, so blocks are always
//! applied in round order even though they are fetched in any order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Serialize, Deserialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::msg::{Request, Response};
use crate::peer::PeerSet;
use crate::round::{self, Round};
use crate::shard::Sharding;
use crate::sink::Sink;
use crate::store::{self, BlockStore, RoundStore, SaveTimer};
use crate::verify::{self, Verifier};
use crate::{block, config};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("verification: {0}")]
    Verify(#[from] verify::Error),
    #[error("round: {0}")]
    Round(#[from] round::Error),
    #[error("storage: {0}")]
    Store(#[from] store::Error),
    #[error("block for round {round} builds on {got}, not {want}")]
    Parent { round: i64, want: String, got: String },
    #[error("engine stopped")]
    Closed,
    #[error("engine queue full")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharderStatus {
    Normal,
    Syncing,
}

/// Snapshot of engine progress, published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub current_round: i64,
    pub lfb_hash: String,
    pub syncing: bool,
    pub end_round: i64,
    pub sharder_status: SharderStatus,
    pub repaired: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            current_round: 0,
            lfb_hash: String::from(block::GENESIS_HASH),
            syncing: false,
            end_round: 0,
            sharder_status: SharderStatus::Normal,
            repaired: 0,
        }
    }
}

#[derive(Debug)]
enum Ingress {
    Block(block::Block),
    BatchStarted { end_round: i64 },
    BatchDone { applied: usize },
    Repair(i64),
    Repaired(block::Block),
}

/// Everything the engine talks to. Cheap to clone.
#[derive(Clone)]
pub struct Deps {
    pub blocks: Arc<dyn BlockStore>,
    pub rounds: Arc<dyn RoundStore>,
    pub sharders: Arc<dyn PeerSet>,
    pub miners: Arc<dyn PeerSet>,
    pub verifier: Arc<dyn Verifier>,
    pub cache: Arc<Cache>,
    pub sink: Arc<dyn Sink>,
    pub sharding: Arc<Sharding>,
}

/// Read access to engine progress plus the engine's ingress.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Ingress>,
    status: watch::Receiver<Status>,
}

impl Handle {
    /// Hands over a block received from the network. It is verified by the engine.
    pub async fn submit(&self, b: block::Block) -> Result<(), Error> {
        self.tx.send(Ingress::Block(b)).await.map_err(|_| Error::Closed)
    }

    /// Like [`Handle::submit`] but gives up at once when the queue is full.
    pub fn try_submit(&self, b: block::Block) -> Result<(), Error> {
        self.tx.try_send(Ingress::Block(b)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Busy,
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    pub async fn request_repair(&self, round: i64) -> Result<(), Error> {
        self.tx.send(Ingress::Repair(round)).await.map_err(|_| Error::Closed)
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn current_round(&self) -> i64 {
        self.status.borrow().current_round
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }
}

pub struct Engine {
    pub(crate) cfg: config::RoundSync,
    pub(crate) deps: Deps,
    current: Round,
    rounds: BTreeMap<i64, Round>,
    syncing: bool,
    end_round: i64,
    sharder_status: SharderStatus,
    repaired: u64,
    timer: SaveTimer,
    tx: mpsc::Sender<Ingress>,
    rx: mpsc::Receiver<Ingress>,
    status: watch::Sender<Status>,
}

impl Engine {
    pub fn new(cfg: config::RoundSync, deps: Deps) -> (Self, Handle) {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let (status, status_rx) = watch::channel(Status::default());
        let handle = Handle { tx: tx.clone(), status: status_rx };
        let engine = Self {
            cfg,
            deps,
            current: Round::genesis(),
            rounds: BTreeMap::new(),
            syncing: false,
            end_round: 0,
            sharder_status: SharderStatus::Normal,
            repaired: 0,
            timer: SaveTimer::default(),
            tx,
            rx,
            status,
        };
        (engine, handle)
    }

    pub fn current_round(&self) -> i64 {
        self.current.number
    }

    /// Restores progress from the round store, seeding genesis on a fresh node.
    pub async fn load(&mut self) -> Result<i64, Error> {
        match self.deps.rounds.most_recent().await {
            Ok(r) if r.is_valid() => {
                info!(round = r.number, hash = %r.block_hash, "resuming from stored round");
                self.current = r;
            }
            Ok(_) | Err(store::Error::RoundNotFound(_)) => {
                info!("no stored rounds, starting from genesis");
                let genesis = block::Block::genesis();
                self.deps.blocks.write(&genesis).await?;
                self.deps.rounds.store(&Round::genesis()).await?;
                self.current = Round::genesis();
            }
            Err(e) => return Err(e.into()),
        }
        self.rounds.insert(self.current.number, self.current.clone());
        self.publish();
        Ok(self.current.number)
    }

    pub(crate) fn set_sharder_status(&mut self, status: SharderStatus) {
        if self.sharder_status != status {
            info!(?status, round = self.current.number, "sharder status changed");
            self.sharder_status = status;
            self.publish();
        }
    }

    fn publish(&self) {
        self.status.send_replace(Status {
            current_round: self.current.number,
            lfb_hash: self.current.block_hash.clone(),
            syncing: self.syncing,
            end_round: self.end_round,
            sharder_status: self.sharder_status,
            repaired: self.repaired,
        });
    }

    pub async fn run(mut self, token: CancellationToken) {
        let sleep = tokio::time::sleep(self.cfg.initial_delay());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = &mut sleep => {
                    self.start_sync(&token);
                    sleep.as_mut().reset(tokio::time::Instant::now() + self.cfg.interval());
                }
                Some(msg) = self.rx.recv() => self.handle(msg, &token).await,
            }
        }
        info!(round = self.current.number, "round sync stopped");
    }

    async fn handle(&mut self, msg: Ingress, token: &CancellationToken) {
        match msg {
            Ingress::Block(b) => {
                let want = self.current.number + 1;
                if b.round != want {
                    if b.round > want && !self.syncing {
                        debug!(round = b.round, current_round = self.current.number, "round gap, syncing");
                        self.start_sync(token);
                    } else {
                        debug!(round = b.round, current_round = self.current.number, "dropping out of order block");
                    }
                    return;
                }
                let (round, hash) = (b.round, b.hash.clone());
                if let Err(e) = self.apply(b, self.cfg.strict_durability).await {
                    error!(round, %hash, error = %e, "block rejected");
                }
            }
            Ingress::BatchStarted { end_round } => {
                self.end_round = end_round;
                self.publish();
            }
            Ingress::BatchDone { applied } => {
                debug!(applied, end_round = self.end_round, current_round = self.current.number, "sync batch done");
                self.syncing = false;
                self.publish();
            }
            Ingress::Repair(round) => self.start_repair(round, token),
            Ingress::Repaired(b) => {
                let (round, hash) = (b.round, b.hash.clone());
                match self.store_repair(b).await {
                    Ok(()) => info!(round, %hash, "round repaired"),
                    Err(e) => error!(round, %hash, error = %e, "repair failed"),
                }
            }
        }
    }

    /// Applies the block for the next round. With `strict` a failed write
    /// leaves the round unfinalized; otherwise progress goes on regardless.
    pub(crate) async fn apply(&mut self, b: block::Block, strict: bool) -> Result<(), Error> {
        self.deps.verifier.verify_notarization(&b.hash, &b.tickets)?;
        self.deps.verifier.validate_block(&b)?;
        if b.prev_hash != self.current.block_hash {
            return Err(Error::Parent {
                round: b.round,
                want: self.current.block_hash.clone(),
                got: b.prev_hash,
            });
        }

        let round = self.rounds.entry(b.round).or_insert_with(|| Round::new(b.round));
        round.add_block(&b)?;
        let best_rank = round.best_rank();
        let mut finalized = round.clone();
        finalized.finalize(&b);

        if let Err(e) = self.persist(&b, &finalized).await {
            if strict {
                return Err(e);
            }
            error!(round = b.round, hash = %b.hash, error = %e, "storing finalized round failed, advancing anyway");
        }

        let b = Arc::new(b);
        self.deps.cache.add(b.clone());
        self.deps.sink.block_finalized(&b.summary(), &b.txn_summaries());

        self.current = finalized.clone();
        self.rounds.insert(finalized.number, finalized);
        let keep = self.current.number - self.cfg.keep_rounds;
        self.rounds = self.rounds.split_off(&keep);
        self.publish();
        debug!(round = b.round, hash = %b.hash, rank = b.round_rank, ?best_rank, txns = b.txns.len(), "round finalized");
        Ok(())
    }

    // block before round, so a stored round never names a missing block
    async fn persist(&self, b: &block::Block, r: &Round) -> Result<(), Error> {
        if self.deps.sharding.is_block_sharder(&b.hash) {
            let start = Instant::now();
            self.deps.blocks.write(b).await?;
            if let Some(p95) = self.timer.record(start.elapsed()) {
                error!(round = b.round, took = ?start.elapsed(), ?p95, "block save - slow");
            }
        }
        self.deps.rounds.store(r).await?;
        Ok(())
    }

    fn start_sync(&mut self, token: &CancellationToken) {
        if self.syncing {
            return;
        }
        self.syncing = true;
        self.publish();
        let batch = Batch {
            deps: self.deps.clone(),
            cfg: self.cfg.clone(),
            current: self.current.number,
            tx: self.tx.clone(),
        };
        tokio::spawn(batch.run(token.child_token()));
    }

    fn start_repair(&self, round: i64, token: &CancellationToken) {
        if round < 1 || round > self.current.number {
            debug!(round, current_round = self.current.number, "ignoring repair request");
            return;
        }
        let deps = self.deps.clone();
        let tx = self.tx.clone();
        let timeout = self.cfg.fetch_timeout();
        let token = token.child_token();
        tokio::spawn(async move {
            let fetch = async {
                // a finalized round only ever takes back its own block
                match deps.rounds.block_hash(round).await {
                    Ok(hash) => fetch_remote_by_hash(&deps, round, &hash).await,
                    Err(_) => fetch_remote(&deps, round).await,
                }
            };
            let fetched = tokio::select! {
                _ = token.cancelled() => return,
                res = tokio::time::timeout(timeout, fetch) => res.ok().flatten(),
            };
            match fetched {
                Some(b) => {
                    let _ = tx.send(Ingress::Repaired(b)).await;
                }
                None => warn!(round, "no peer could supply round for repair"),
            }
        });
    }

    /// Rewrites a past round without moving progress.
    async fn store_repair(&mut self, b: block::Block) -> Result<(), Error> {
        self.deps.verifier.verify_notarization(&b.hash, &b.tickets)?;
        self.deps.verifier.validate_block(&b)?;
        let stored = match self.deps.rounds.get(b.round).await {
            Ok(r) if r.is_valid() => Some(r),
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let mut r = match (stored, self.rounds.get(&b.round)) {
            (Some(r), _) => r,
            (None, Some(known)) => known.clone(),
            (None, None) => Round::new(b.round),
        };
        r.add_block(&b)?;
        r.finalize(&b);
        self.persist(&b, &r).await?;
        self.repaired += 1;
        self.publish();
        Ok(())
    }
}

/// One catch-up cycle, run off the engine task.
struct Batch {
    deps: Deps,
    cfg: config::RoundSync,
    current: i64,
    tx: mpsc::Sender<Ingress>,
}

impl Batch {
    async fn run(self, token: CancellationToken) {
        let applied = tokio::select! {
            _ = token.cancelled() => return,
            applied = self.fetch_and_send() => applied,
        };
        let _ = self.tx.send(Ingress::BatchDone { applied }).await;
    }

    async fn fetch_and_send(&self) -> usize {
        let Some(end) = self.target().await else { return 0 };
        let _ = self.tx.send(Ingress::BatchStarted { end_round: end }).await;
        info!(current_round = self.current, end_round = end, "syncing rounds");
        let blocks = fetch_range(&self.deps, &self.cfg, self.current + 1, end).await;
        let applied = blocks.len();
        if (applied as i64) < end - self.current {
            debug!(missing = self.current + applied as i64 + 1, end_round = end, "batch truncated at gap");
        }
        for b in blocks {
            if self.tx.send(Ingress::Block(b)).await.is_err() {
                break;
            }
        }
        applied
    }

    /// Last round to fetch this cycle, or nothing when caught up.
    async fn target(&self) -> Option<i64> {
        let ticket = lfb_ticket(self.deps.sharders.as_ref()).await?;
        if ticket + self.cfg.look_ahead <= self.current {
            return None;
        }
        Some((ticket + self.cfg.look_ahead).min(self.current + self.cfg.max_batch))
    }
}

/// Highest finalized round the sharders claim.
pub async fn lfb_ticket(sharders: &dyn PeerSet) -> Option<i64> {
    let round = sharders
        .request_from_all(&Request::LfbTicket)
        .await
        .into_iter()
        .filter_map(|(_, r)| r.into_ticket())
        .map(|t| t.round)
        .max();
    if round.is_none() {
        warn!("no sharder reported a latest finalized round");
    }
    round
}

/// Fetches `from..=to` concurrently and returns the contiguous prefix that arrived.
async fn fetch_range(deps: &Deps, cfg: &config::RoundSync, from: i64, to: i64) -> Vec<block::Block> {
    if to < from {
        return Vec::new();
    }
    let n = (to - from + 1) as usize;
    let permits = Arc::new(Semaphore::new(cfg.max_batch.max(1) as usize));
    let mut tasks = JoinSet::new();
    for round in from..=to {
        let deps = deps.clone();
        let permits = permits.clone();
        let timeout = cfg.fetch_timeout();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            match tokio::time::timeout(timeout, fetch(&deps, round)).await {
                Ok(b) => b,
                Err(_) => {
                    debug!(round, "fetch timed out");
                    None
                }
            }
        });
    }
    let mut slab: Vec<Option<block::Block>> = (0..n).map(|_| None).collect();
    while let Some(res) = tasks.join_next().await {
        if let Ok(Some(b)) = res {
            let idx = (b.round - from) as usize;
            if idx < n {
                slab[idx] = Some(b);
            }
        }
    }
    slab.into_iter().map_while(|b| b).collect()
}

/// Local stores first, then sharders, then miners.
async fn fetch(deps: &Deps, round: i64) -> Option<block::Block> {
    if let Some(b) = fetch_local(deps, round).await {
        return Some(b);
    }
    fetch_remote(deps, round).await
}

async fn fetch_local(deps: &Deps, round: i64) -> Option<block::Block> {
    let hash = deps.rounds.block_hash(round).await.ok()?;
    let b = match deps.cache.block(&hash) {
        Some(b) => b.as_ref().clone(),
        None => deps.blocks.read(&hash, round).await.ok()?,
    };
    (b.round == round && b.hash == hash).then_some(b)
}

async fn fetch_remote(deps: &Deps, round: i64) -> Option<block::Block> {
    let verifier = deps.verifier.clone();
    let accept = move |r: &Response| match r {
        Response::Block(b) => b.round == round && verifier.verify_notarization(&b.hash, &b.tickets).is_ok(),
        _ => false,
    };
    let req = Request::Block { round };
    for (kind, peers) in [("sharders", &deps.sharders), ("miners", &deps.miners)] {
        match peers.request_from_one(&req, &accept).await {
            Ok(r) => return r.into_block(),
            Err(e) => debug!(round, peers = kind, error = %e, "no notarized block"),
        }
    }
    None
}

/// Fetches exactly the block a stored round names.
async fn fetch_remote_by_hash(deps: &Deps, round: i64, hash: &str) -> Option<block::Block> {
    let verifier = deps.verifier.clone();
    let want = hash.to_string();
    let accept = move |r: &Response| match r {
        Response::Block(b) => {
            b.round == round && b.hash == want && verifier.verify_notarization(&b.hash, &b.tickets).is_ok()
        }
        _ => false,
    };
    let req = Request::BlockByHash { hash: hash.to_string(), round };
    for (kind, peers) in [("sharders", &deps.sharders), ("miners", &deps.miners)] {
        match peers.request_from_one(&req, &accept).await {
            Ok(r) => return r.into_block(),
            Err(e) => debug!(round, %hash, peers = kind, error = %e, "no copy of finalized block"),
        }
    }
    None
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::account;
    use crate::peer::tests::MockPeers;
    use crate::sink::tests::RecordingSink;
    use crate::store::mem::MemBlockStore;
    use crate::store::round::MemRoundStore;
    use crate::verify::tests::setup as verifier;
    use async_trait::async_trait;
    use std::time::Duration;

    pub struct Setup {
        pub miners: Vec<account::Keypair>,
        pub chain: Vec<block::Block>,
        pub deps: Deps,
        pub blocks: Arc<MemBlockStore>,
        pub rounds: Arc<MemRoundStore>,
        pub sharders: Arc<MockPeers>,
        pub sink: Arc<RecordingSink>,
    }

    /// Notarized chain of `n` blocks on top of genesis.
    pub fn notarized_chain(miners: &[account::Keypair], n: i64) -> Vec<block::Block> {
        let mut prev = block::Block::genesis();
        let mut out = Vec::new();
        for _ in 0..n {
            let b = block::Builder::new(&prev).notarize(&miners[0], miners);
            prev = b.clone();
            out.push(b);
        }
        out
    }

    pub fn setup(n: i64) -> Setup {
        let (miners, verifier) = verifier(3);
        let chain = notarized_chain(&miners, n);
        let blocks = Arc::new(MemBlockStore::default());
        let rounds = Arc::new(MemRoundStore::default());
        let sharders = Arc::new(MockPeers::default());
        let sink = Arc::new(RecordingSink::default());
        let deps = Deps {
            blocks: blocks.clone(),
            rounds: rounds.clone(),
            sharders: sharders.clone(),
            miners: Arc::new(MockPeers::default()),
            verifier: Arc::new(verifier),
            cache: Arc::new(Cache::new(16)),
            sink: sink.clone(),
            sharding: Arc::new(Sharding::all("self")),
        };
        Setup { miners, chain, deps, blocks, rounds, sharders, sink }
    }

    pub fn cfg() -> config::RoundSync {
        config::RoundSync { initial_delay_secs: 1, interval_secs: 60, ..Default::default() }
    }

    async fn started(s: &Setup, cfg: config::RoundSync) -> (Handle, CancellationToken, tokio::task::JoinHandle<()>) {
        let (mut engine, handle) = Engine::new(cfg, s.deps.clone());
        engine.load().await.unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(engine.run(token.clone()));
        (handle, token, task)
    }

    async fn wait_for(handle: &Handle, round: i64) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| s.current_round >= round))
            .await
            .unwrap()
            .unwrap();
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn live_in_order() {
        let s = setup(3);
        let (handle, token, task) = started(&s, cfg()).await;
        for b in &s.chain {
            handle.submit(b.clone()).await.unwrap();
        }
        wait_for(&handle, 3).await;
        assert_eq!(handle.status().lfb_hash, s.chain[2].hash);
        assert_eq!(*s.sink.rounds.lock(), vec![1, 2, 3]);
        assert_eq!(s.blocks.len(), 4);
        assert_eq!(s.rounds.most_recent().await.unwrap().block_hash, s.chain[2].hash);
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order() {
        let s = setup(7);
        // nothing to fetch from the network yet
        let (handle, token, task) = started(&s, config::RoundSync { initial_delay_secs: 3600, ..cfg() }).await;
        for i in [0, 1, 2, 3, 4, 6] {
            handle.submit(s.chain[i].clone()).await.unwrap();
        }
        wait_for(&handle, 5).await;
        settle().await;
        // round 7 arrived before round 6 and was dropped
        assert_eq!(handle.current_round(), 5);
        handle.submit(s.chain[5].clone()).await.unwrap();
        handle.submit(s.chain[6].clone()).await.unwrap();
        wait_for(&handle, 7).await;
        let applied = s.sink.rounds.lock().clone();
        assert_eq!(applied, (1..=7).collect::<Vec<_>>());
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gap_triggers_sync() {
        let s = setup(6);
        s.sharders.add(&s.chain);
        *s.sharders.ticket.write() = Some(6);
        let (handle, token, task) = started(&s, config::RoundSync { initial_delay_secs: 3600, ..cfg() }).await;
        handle.submit(s.chain[4].clone()).await.unwrap();
        wait_for(&handle, 6).await;
        assert_eq!(*s.sink.rounds.lock(), (1..=6).collect::<Vec<_>>());
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_is_noop() {
        let s = setup(2);
        let (handle, token, task) = started(&s, config::RoundSync { initial_delay_secs: 3600, ..cfg() }).await;
        handle.submit(s.chain[0].clone()).await.unwrap();
        handle.submit(s.chain[1].clone()).await.unwrap();
        wait_for(&handle, 2).await;
        handle.submit(s.chain[0].clone()).await.unwrap();
        handle.submit(s.chain[1].clone()).await.unwrap();
        settle().await;
        assert_eq!(handle.current_round(), 2);
        assert_eq!(s.sink.rounds.lock().len(), 2);
        assert_eq!(s.rounds.get(1).await.unwrap().block_hash, s.chain[0].hash);
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_unnotarized() {
        let s = setup(1);
        let (handle, token, task) = started(&s, config::RoundSync { initial_delay_secs: 3600, ..cfg() }).await;
        let mut forged = s.chain[0].clone();
        forged.tickets.truncate(1);
        handle.submit(forged).await.unwrap();
        let mut broken = s.chain[0].clone();
        broken.state_hash = String::from("00");
        handle.submit(broken).await.unwrap();
        settle().await;
        assert_eq!(handle.current_round(), 0);
        handle.submit(s.chain[0].clone()).await.unwrap();
        wait_for(&handle, 1).await;
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_truncates_at_gap() {
        let s = setup(30);
        s.sharders.add(&s.chain);
        s.sharders.hang.write().insert(5);
        *s.sharders.ticket.write() = Some(30);
        let (handle, token, task) = started(&s, cfg()).await;
        let mut rx = handle.subscribe();
        rx.wait_for(|st| st.syncing).await.unwrap();
        rx.wait_for(|st| !st.syncing).await.unwrap();
        assert_eq!(handle.current_round(), 4);
        assert_eq!(handle.status().end_round, 20);
        assert_eq!(*s.sink.rounds.lock(), vec![1, 2, 3, 4]);
        assert!(s.sharders.max_in_flight.load(std::sync::atomic::Ordering::SeqCst) <= 20);
        // the next cycle picks up where the gap was
        s.sharders.hang.write().clear();
        wait_for(&handle, 24).await;
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn caught_up_stays_idle() {
        let s = setup(3);
        *s.sharders.ticket.write() = Some(0);
        let cfg = config::RoundSync { look_ahead: 0, ..cfg() };
        let (handle, token, task) = started(&s, cfg).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        let status = handle.status();
        assert!(!status.syncing);
        assert_eq!(status.end_round, 0);
        assert_eq!(s.sharders.block_requests.load(std::sync::atomic::Ordering::SeqCst), 0);
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_flight() {
        let s = setup(15);
        for r in 1..=15 {
            s.sharders.hang.write().insert(r);
        }
        s.sharders.add(&s.chain);
        *s.sharders.ticket.write() = Some(15);
        let cfg = config::RoundSync { look_ahead: 0, fetch_timeout_secs: 3600, ..cfg() };
        let (handle, token, task) = started(&s, cfg).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(s.sharders.in_flight(), 15);
        token.cancel();
        task.await.unwrap();
        settle().await;
        assert_eq!(s.sharders.in_flight(), 0);
        assert_eq!(handle.current_round(), 0);
        assert!(s.sink.rounds.lock().is_empty());
        assert!(s.rounds.get(1).await.unwrap_err().is_not_found());
    }

    /// Block store whose writes always fail.
    struct Broken;

    #[async_trait]
    impl BlockStore for Broken {
        async fn write(&self, _b: &block::Block) -> Result<(), store::Error> {
            Err(store::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        async fn read(&self, hash: &str, _round: i64) -> Result<block::Block, store::Error> {
            Err(store::Error::NotFound(hash.to_string()))
        }

        async fn exists(&self, _hash: &str) -> bool {
            false
        }

        async fn delete(&self, _hash: &str, _round: i64) -> Result<(), store::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn optimistic_durability() {
        let mut s = setup(1);
        s.deps.blocks = Arc::new(Broken);
        let (mut engine, _handle) = Engine::new(cfg(), s.deps.clone());
        assert!(engine.load().await.is_err());
        engine.apply(s.chain[0].clone(), false).await.unwrap();
        assert_eq!(engine.current_round(), 1);
        // the round record is not written without its block
        assert!(s.rounds.get(1).await.is_err());
    }

    #[tokio::test]
    async fn strict_durability() {
        let mut s = setup(1);
        s.deps.blocks = Arc::new(Broken);
        let (mut engine, handle) = Engine::new(cfg(), s.deps.clone());
        assert!(matches!(
            engine.apply(s.chain[0].clone(), true).await,
            Err(Error::Store(_))
        ));
        assert_eq!(engine.current_round(), 0);
        assert_eq!(handle.current_round(), 0);
        assert!(s.sink.rounds.lock().is_empty());
    }

    #[tokio::test]
    async fn resumes_from_store() {
        let s = setup(3);
        let (mut engine, _) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        let (mut again, handle) = Engine::new(cfg(), s.deps.clone());
        assert_eq!(again.load().await.unwrap(), 3);
        assert_eq!(handle.status().lfb_hash, s.chain[2].hash);
    }

    #[tokio::test(start_paused = true)]
    async fn repair() {
        let s = setup(3);
        s.sharders.add(&s.chain);
        let (handle, token, task) = started(&s, config::RoundSync { initial_delay_secs: 3600, ..cfg() }).await;
        for b in &s.chain {
            handle.submit(b.clone()).await.unwrap();
        }
        wait_for(&handle, 3).await;
        s.blocks.delete(&s.chain[1].hash, 2).await.unwrap();
        handle.request_repair(2).await.unwrap();
        // future rounds are not repaired
        handle.request_repair(9).await.unwrap();
        let mut rx = handle.subscribe();
        rx.wait_for(|st| st.repaired == 1).await.unwrap();
        assert!(s.blocks.exists(&s.chain[1].hash).await);
        assert_eq!(handle.current_round(), 3);
        token.cancel();
        task.await.unwrap();
    }

    /// Notarized block for the same round as `chain[i]` but a worse rank.
    fn competing(s: &Setup, i: usize, rank: i32) -> block::Block {
        let prev = if i == 0 { block::Block::genesis() } else { s.chain[i - 1].clone() };
        let mut b = block::Builder::new(&prev);
        b.round_rank = rank;
        b.notarize(&s.miners[0], &s.miners)
    }

    #[tokio::test(start_paused = true)]
    async fn repair_keeps_finalized_hash() {
        let s = setup(15);
        s.sharders.add(&s.chain);
        let alt = competing(&s, 1, 1);
        // a round lookup now answers with the competing block
        s.sharders.blocks.write().insert(2, alt.clone());
        let (handle, token, task) = started(&s, config::RoundSync { initial_delay_secs: 3600, ..cfg() }).await;
        for b in &s.chain {
            handle.submit(b.clone()).await.unwrap();
        }
        wait_for(&handle, 15).await;
        s.blocks.delete(&s.chain[1].hash, 2).await.unwrap();
        handle.request_repair(2).await.unwrap();
        let mut rx = handle.subscribe();
        rx.wait_for(|st| st.repaired == 1).await.unwrap();
        assert_eq!(s.rounds.get(2).await.unwrap().block_hash, s.chain[1].hash);
        assert!(s.blocks.exists(&s.chain[1].hash).await);
        assert!(!s.blocks.exists(&alt.hash).await);
        assert_eq!(handle.current_round(), 15);
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn repair_rejects_other_block() {
        let s = setup(15);
        let (mut engine, handle) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        // round 2 has long left memory, only the store knows it
        let alt = competing(&s, 1, 1);
        assert!(matches!(
            engine.store_repair(alt.clone()).await,
            Err(Error::Round(round::Error::Conflict { round: 2, .. }))
        ));
        assert_eq!(s.rounds.get(2).await.unwrap().block_hash, s.chain[1].hash);
        assert!(!s.blocks.exists(&alt.hash).await);
        assert_eq!(handle.status().repaired, 0);
    }

    #[tokio::test]
    async fn wrong_parent() {
        let s = setup(2);
        let (mut engine, handle) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        engine.apply(competing(&s, 0, 3), true).await.unwrap();
        assert_eq!(engine.current_round(), 1);
        assert!(matches!(
            engine.apply(s.chain[1].clone(), true).await,
            Err(Error::Parent { round: 2, .. })
        ));
        assert_eq!(engine.current_round(), 1);
        assert_eq!(handle.current_round(), 1);
        assert!(s.rounds.get(2).await.unwrap_err().is_not_found());
        assert_eq!(s.sink.rounds.lock().len(), 1);
    }

    #[tokio::test]
    async fn local_fetch_checks_record() {
        let s = setup(3);
        let (mut engine, _) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        // round 2's record points at round 3's block
        let mut bad = Round::new(2);
        bad.finalize(&s.chain[2]);
        s.rounds.store(&bad).await.unwrap();
        assert!(fetch_local(&s.deps, 2).await.is_none());
        assert_eq!(fetch_local(&s.deps, 3).await.unwrap().hash, s.chain[2].hash);
    }

    #[tokio::test]
    async fn full_queue_is_busy() {
        let s = setup(2);
        let (engine, handle) = Engine::new(config::RoundSync { channel_capacity: 1, ..cfg() }, s.deps.clone());
        handle.try_submit(s.chain[0].clone()).unwrap();
        assert!(matches!(handle.try_submit(s.chain[1].clone()), Err(Error::Busy)));
        drop(engine);
        assert!(matches!(handle.try_submit(s.chain[1].clone()), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn sharded_blocks() {
        let mut s = setup(20);
        let ids: Vec<_> = (0..4).map(|i| format!("sharder-{}", i)).collect();
        s.deps.sharding = Arc::new(Sharding::new(&ids[0], ids.clone(), 1));
        let (mut engine, _) = Engine::new(cfg(), s.deps.clone());
        engine.load().await.unwrap();
        for b in &s.chain {
            engine.apply(b.clone(), true).await.unwrap();
        }
        assert_eq!(engine.current_round(), 20);
        for b in &s.chain {
            // every round is on record, the body only where it belongs
            assert_eq!(s.rounds.get(b.round).await.unwrap().block_hash, b.hash);
            assert_eq!(s.blocks.exists(&b.hash).await, s.deps.sharding.is_block_sharder(&b.hash));
        }
        // genesis plus a share of the rest
        assert!(s.blocks.len() < 21);
    }
}
