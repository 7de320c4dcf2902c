use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::Cache;
use crate::config::{self, Config};
use crate::engine::{self, Deps, Engine, Handle};
use crate::health::{self, Reports, Scanner};
use crate::peer::{self, HttpPeerSet};
use crate::shard::Sharding;
use crate::store::tiered::TieredBlockStore;
use crate::store::{self, BlockStore};
use crate::verify::ThresholdVerifier;
use crate::{account, app, prune, registration, sink, tiering};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(#[from] config::Error),
    #[error("keys: {0}")]
    Key(#[from] account::Error),
    #[error("storage: {0}")]
    Store(#[from] store::Error),
    #[error("peers: {0}")]
    Peer(#[from] peer::Error),
    #[error("engine: {0}")]
    Engine(#[from] engine::Error),
    #[error("binding {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
}

/// A fully wired sharder, ready to run.
pub struct Node {
    cfg: Config,
    kp: Arc<account::Keypair>,
    deps: Deps,
    engine: Engine,
    handle: Handle,
    tiered: Option<Arc<TieredBlockStore>>,
    listener: TcpListener,
}

impl Node {
    /// Opens storage, builds the peer sets and binds the listener. Any
    /// failure here means the node can't start.
    pub fn from_config(cfg: Config, kp: account::Keypair) -> Result<Self, Error> {
        cfg.validate()?;
        if kp.id() != cfg.server.id {
            return Err(config::Error::Invalid(format!(
                "keys file belongs to {}, not server.id {}",
                kp.id(),
                cfg.server.id
            ))
            .into());
        }

        let hot = store::open(&cfg.storage)?;
        let (blocks, tiered) = if cfg.tiering.enabled {
            let cold: Arc<dyn BlockStore> = match (&cfg.tiering.endpoint, &cfg.tiering.dir) {
                (Some(endpoint), _) => Arc::new(store::http::HttpBlockStore::new(endpoint, cfg.peers.timeout())?),
                (None, Some(dir)) => Arc::new(store::fs::FsBlockStore::new(dir)),
                (None, None) => return Err(config::Error::Invalid(String::from("tiering has no cold store")).into()),
            };
            let tiered = Arc::new(TieredBlockStore::new(hot, cold, cfg.tiering.delete_local));
            let blocks: Arc<dyn BlockStore> = tiered.clone();
            (blocks, Some(tiered))
        } else {
            (hot, None)
        };

        let miner_keys = cfg
            .peers
            .miners
            .iter()
            .map(|m| account::public_key_from_hex(&m.public_key))
            .collect::<Result<Vec<_>, _>>()?;
        let sharding = Sharding::new(
            &cfg.server.id,
            cfg.peers.sharders.iter().map(|p| p.id.clone()).chain([cfg.server.id.clone()]),
            cfg.sharding.replication,
        );

        let deps = Deps {
            blocks,
            rounds: store::open_rounds(&cfg.storage)?,
            sharders: Arc::new(HttpPeerSet::new(&cfg.peers.sharders, &cfg.server.id, &cfg.peers)?),
            miners: Arc::new(HttpPeerSet::new(&cfg.peers.miners, &cfg.server.id, &cfg.peers)?),
            verifier: Arc::new(ThresholdVerifier::new(miner_keys, cfg.verify.threshold)),
            cache: Arc::new(Cache::new(cfg.storage.cache_size)),
            sink: Arc::new(sink::LogSink),
            sharding: Arc::new(sharding),
        };
        let (engine, handle) = Engine::new(cfg.sync.clone(), deps.clone());

        let listener = TcpListener::bind(&cfg.server.address).map_err(|source| Error::Bind {
            addr: cfg.server.address.clone(),
            source,
        })?;

        Ok(Self { cfg, kp: Arc::new(kp), deps, engine, handle, tiered, listener })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Loads state, rejoins the fleet, then runs every worker until cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<(), Error> {
        let Node { cfg, kp, deps, mut engine, handle, tiered, listener } = self;
        let round = engine.load().await?;
        info!(id = %cfg.server.id, round, "sharder starting");

        let reports = Arc::new(Reports::default());
        let tiering = tiered.map(|store| {
            let (rounds, sharding) = (deps.rounds.clone(), deps.sharding.clone());
            tiering::Worker::new(cfg.tiering.clone(), store, rounds, sharding, handle.clone())
        });
        let state = app::State {
            id: cfg.server.id.clone(),
            engine: handle.clone(),
            blocks: deps.blocks.clone(),
            rounds: deps.rounds.clone(),
            cache: deps.cache.clone(),
            reports: reports.clone(),
            tiering: tiering.as_ref().map(|w| w.stats()),
        };

        let mut tasks = JoinSet::new();
        // status is served while rejoining
        tasks.spawn(app::serve(listener, Arc::new(state), token.clone()));

        engine.rejoin(&cfg.rejoin, &token).await;

        for (mode, scan) in [
            (health::Mode::Deep, cfg.health.deep.clone()),
            (health::Mode::Proximity, cfg.health.proximity.clone()),
        ] {
            let scanner = Scanner::new(mode, scan, &deps, handle.clone(), reports.clone());
            tasks.spawn(scanner.run(token.clone()));
        }
        if let Some(worker) = tiering {
            tasks.spawn(worker.run(token.clone()));
        }
        let pruner = prune::Worker::new(cfg.prune.clone(), deps.rounds.clone(), handle.clone());
        tasks.spawn(pruner.run(token.clone()));
        let registration = registration::Worker::new(
            cfg.registration.clone(),
            kp,
            deps.sharders.clone(),
            deps.miners.clone(),
        );
        tasks.spawn(registration.run(token.clone()));
        tasks.spawn(engine.run(token.clone()));

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!("sharder stopped");
        Ok(())
    }
}
