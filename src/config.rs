//! Node configuration, read from a TOML file. Every field has a default so
//! an empty file yields a runnable development node.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Deserialize};

use crate::account;

/// Largest number of rounds fetched concurrently in one sync batch.
pub const MAX_REQUEST_BLOCKS: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading config {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Development,
    Testnet,
    Mainnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Fs,
    Kv,
    Multi,
    Mem,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub sync: RoundSync,
    pub rejoin: Rejoin,
    pub storage: Storage,
    pub health: Health,
    pub tiering: Tiering,
    pub registration: Registration,
    pub prune: Prune,
    pub sharding: Sharding,
    pub peers: Peers,
    pub verify: Verify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub address: String,
    pub id: account::NodeId,
    pub deployment_mode: DeploymentMode,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:7171"),
            id: String::new(),
            deployment_mode: DeploymentMode::Development,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundSync {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub max_batch: i64,
    pub look_ahead: i64,
    pub fetch_timeout_secs: u64,
    pub channel_capacity: usize,
    pub strict_durability: bool,
    pub keep_rounds: i64,
}

impl Default for RoundSync {
    fn default() -> Self {
        Self {
            initial_delay_secs: 7,
            interval_secs: 60,
            max_batch: MAX_REQUEST_BLOCKS,
            look_ahead: 5,
            fetch_timeout_secs: 8,
            channel_capacity: 128,
            strict_durability: false,
            keep_rounds: 10,
        }
    }
}

impl RoundSync {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rejoin {
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for Rejoin {
    fn default() -> Self {
        Self { retries: 3, retry_delay_secs: 1 }
    }
}

impl Rejoin {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub provider: Provider,
    pub blocks_dir: PathBuf,
    pub blocks_db: PathBuf,
    pub rounds_db: PathBuf,
    pub cache_size: usize,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            provider: Provider::Fs,
            blocks_dir: PathBuf::from("data/blocks"),
            blocks_db: PathBuf::from("data/blocksdb"),
            rounds_db: PathBuf::from("data/rounds"),
            cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scan {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: i64,
    pub window: i64,
}

impl Scan {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for Scan {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 60, batch_size: 1000, window: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Health {
    pub deep: Scan,
    pub proximity: Scan,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            deep: Scan::default(),
            proximity: Scan { enabled: true, interval_secs: 10, batch_size: 100, window: 100 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tiering {
    pub enabled: bool,
    pub interval_secs: u64,
    pub old_block_round_range: i64,
    pub num_workers: usize,
    pub delete_local: bool,
    pub endpoint: Option<String>,
    pub dir: Option<PathBuf>,
}

impl Default for Tiering {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            old_block_round_range: 500,
            num_workers: 5,
            delete_local: true,
            endpoint: None,
            dir: None,
        }
    }
}

impl Tiering {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    pub enabled: bool,
    pub repeat_secs: u64,
    pub health_ping_interval_secs: u64,
}

impl Default for Registration {
    fn default() -> Self {
        Self { enabled: true, repeat_secs: 5, health_ping_interval_secs: 300 }
    }
}

impl Registration {
    pub fn repeat(&self) -> Duration {
        Duration::from_secs(self.repeat_secs)
    }

    pub fn health_ping_interval(&self) -> Duration {
        Duration::from_secs(self.health_ping_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Prune {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Round records kept below the current round.
    pub keep_rounds: i64,
}

impl Default for Prune {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 300, keep_rounds: 100_000 }
    }
}

impl Prune {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sharding {
    /// Sharders storing each block body; 0 means all of them.
    pub replication: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: account::NodeId,
    pub url: String,
    #[serde(default)]
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Peers {
    pub sharders: Vec<Peer>,
    pub miners: Vec<Peer>,
    pub timeout_secs: u64,
    pub max_failures: u32,
    pub retry_after_secs: u64,
}

impl Default for Peers {
    fn default() -> Self {
        Self {
            sharders: Vec::new(),
            miners: Vec::new(),
            timeout_secs: 5,
            max_failures: 3,
            retry_after_secs: 30,
        }
    }
}

impl Peers {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Verify {
    pub threshold: u32,
}

impl Default for Verify {
    fn default() -> Self {
        Self { threshold: 66 }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source
        })?;
        text.parse()
    }

    pub fn development(&self) -> bool {
        self.server.deployment_mode == DeploymentMode::Development
    }

    /// Startup preconditions; any failure here is fatal.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sync.max_batch < 1 || self.sync.max_batch > MAX_REQUEST_BLOCKS {
            return Err(Error::Invalid(format!(
                "sync.max_batch must be within 1..={}",
                MAX_REQUEST_BLOCKS
            )));
        }
        if self.sync.look_ahead < 0 {
            return Err(Error::Invalid(String::from("sync.look_ahead must not be negative")));
        }
        if self.server.id.is_empty() {
            return Err(Error::Invalid(String::from("server.id is not set")));
        }
        if !self.peers.sharders.iter().any(|p| p.id == self.server.id) {
            return Err(Error::Invalid(format!(
                "self node {} is not configured as a sharder",
                self.server.id
            )));
        }
        if !(1..=100).contains(&self.verify.threshold) {
            return Err(Error::Invalid(String::from("verify.threshold must be a percentage")));
        }
        if self.tiering.enabled && self.tiering.endpoint.is_none() && self.tiering.dir.is_none() {
            return Err(Error::Invalid(String::from("tiering enabled without endpoint or dir")));
        }
        if self.prune.enabled && self.prune.keep_rounds < 1 {
            return Err(Error::Invalid(String::from("prune.keep_rounds must be positive")));
        }
        // tiering finds old blocks through the round records
        if self.prune.enabled
            && self.tiering.enabled
            && self.prune.keep_rounds <= self.tiering.old_block_round_range
        {
            return Err(Error::Invalid(String::from(
                "prune.keep_rounds must exceed tiering.old_block_round_range",
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn setup(id: &str) -> Config {
        let mut cfg = Config::default();
        cfg.server.id = id.to_string();
        cfg.peers.sharders.push(Peer {
            id: id.to_string(),
            url: String::from("http://127.0.0.1:7171"),
            public_key: String::new(),
        });
        cfg
    }

    #[test]
    fn empty_is_default() {
        let cfg: Config = "".parse().unwrap();
        assert_eq!(cfg.sync.max_batch, 20);
        assert_eq!(cfg.sync.look_ahead, 5);
        assert_eq!(cfg.sync.fetch_timeout(), Duration::from_secs(8));
        assert_eq!(cfg.storage.provider, Provider::Fs);
        assert!(!cfg.tiering.enabled);
        assert!(cfg.development());
    }

    #[test]
    fn parse() {
        let cfg: Config = r#"
            [server]
            id = "abc"
            deployment_mode = "mainnet"

            [sync]
            max_batch = 10
            strict_durability = true

            [storage]
            provider = "multi"

            [tiering]
            enabled = true
            endpoint = "http://cold:9000/blocks"

            [[peers.sharders]]
            id = "abc"
            url = "http://s1:7171"

            [[peers.miners]]
            id = "m1"
            url = "http://m1:7071"
            public_key = "00"
        "#
        .parse()
        .unwrap();
        assert_eq!(cfg.sync.max_batch, 10);
        assert!(cfg.sync.strict_durability);
        assert_eq!(cfg.sync.interval_secs, 60);
        assert_eq!(cfg.storage.provider, Provider::Multi);
        assert_eq!(cfg.peers.miners.len(), 1);
        assert!(!cfg.development());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn shipped_config_parses() {
        let cfg: Config = include_str!("../config/sharder.toml").parse().unwrap();
        assert_eq!(cfg.sync.max_batch, MAX_REQUEST_BLOCKS);
        assert_eq!(cfg.health.proximity.window, 100);
        assert_eq!(cfg.prune.keep_rounds, 100_000);
        assert_eq!(cfg.sharding.replication, 0);
        // node identity is filled in per deployment
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn prune_keeps_tiering_window() {
        let mut cfg = setup("abc");
        cfg.tiering.enabled = true;
        cfg.tiering.dir = Some(PathBuf::from("cold"));
        assert!(cfg.validate().is_ok());
        cfg.prune.keep_rounds = cfg.tiering.old_block_round_range;
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));
        cfg.prune.enabled = false;
        assert!(cfg.validate().is_ok());
        cfg.prune = Prune { keep_rounds: 0, ..Default::default() };
        cfg.tiering.enabled = false;
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn unknown_provider() {
        assert!(matches!(
            "[storage]\nprovider = \"tape\"".parse::<Config>(),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn invalid() {
        assert!(matches!(Config::default().validate(), Err(Error::Invalid(_))));
        let mut cfg = setup("self");
        assert!(cfg.validate().is_ok());
        cfg.sync.max_batch = 21;
        assert!(cfg.validate().is_err());
        let mut cfg = setup("self");
        cfg.server.id = String::from("other");
        assert!(cfg.validate().is_err());
        let mut cfg = setup("self");
        cfg.tiering.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.tiering.dir = Some(PathBuf::from("/mnt/cold"));
        assert!(cfg.validate().is_ok());
        cfg.verify.threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file() {
        assert!(matches!(Config::load("/nonexistent/sharder.toml"), Err(Error::Read { .. })));
    }
}
