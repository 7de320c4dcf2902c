use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Error;
use crate::round::Round;

/// Round records keyed by round number. The record's block hash doubles as
/// the round to block index.
#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn store(&self, r: &Round) -> Result<(), Error>;

    async fn get(&self, number: i64) -> Result<Round, Error>;

    async fn most_recent(&self) -> Result<Round, Error>;

    /// Lowest round still on record.
    async fn oldest(&self) -> Result<Round, Error>;

    /// Drops every record below `number`, returning how many went.
    async fn prune_below(&self, number: i64) -> Result<usize, Error>;

    /// Hash of the block finalized for `number`, if a valid record exists.
    async fn block_hash(&self, number: i64) -> Result<String, Error> {
        let r = self.get(number).await?;
        if r.is_valid() {
            Ok(r.block_hash)
        } else {
            Err(Error::RoundNotFound(number))
        }
    }
}

/// Sled tree keyed by big-endian round number so iteration order is round order.
#[derive(Debug, Clone)]
pub struct KvRoundStore {
    rounds: sled::Tree,
}

impl KvRoundStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Ok(Self { rounds: db.open_tree("rounds")? })
    }
}

#[async_trait]
impl RoundStore for KvRoundStore {
    async fn store(&self, r: &Round) -> Result<(), Error> {
        self.rounds.insert(r.number.to_be_bytes(), serde_json::to_vec(r)?)?;
        Ok(())
    }

    async fn get(&self, number: i64) -> Result<Round, Error> {
        let bytes = self
            .rounds
            .get(number.to_be_bytes())?
            .ok_or(Error::RoundNotFound(number))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn most_recent(&self) -> Result<Round, Error> {
        let (_, bytes) = self.rounds.last()?.ok_or(Error::RoundNotFound(-1))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn oldest(&self) -> Result<Round, Error> {
        let (_, bytes) = self.rounds.first()?.ok_or(Error::RoundNotFound(-1))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn prune_below(&self, number: i64) -> Result<usize, Error> {
        // negative keys would sort after the positive ones
        if number <= 0 {
            return Ok(0);
        }
        let mut pruned = 0;
        for key in self.rounds.range(..number.to_be_bytes()).keys() {
            self.rounds.remove(key?)?;
            pruned += 1;
        }
        Ok(pruned)
    }
}

#[derive(Debug, Default)]
pub struct MemRoundStore {
    rounds: RwLock<BTreeMap<i64, Round>>,
}

impl MemRoundStore {
    pub fn len(&self) -> usize {
        self.rounds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.read().is_empty()
    }
}

#[async_trait]
impl RoundStore for MemRoundStore {
    async fn store(&self, r: &Round) -> Result<(), Error> {
        self.rounds.write().insert(r.number, r.clone());
        Ok(())
    }

    async fn get(&self, number: i64) -> Result<Round, Error> {
        self.rounds.read().get(&number).cloned().ok_or(Error::RoundNotFound(number))
    }

    async fn most_recent(&self) -> Result<Round, Error> {
        self.rounds
            .read()
            .values()
            .next_back()
            .cloned()
            .ok_or(Error::RoundNotFound(-1))
    }

    async fn oldest(&self) -> Result<Round, Error> {
        self.rounds.read().values().next().cloned().ok_or(Error::RoundNotFound(-1))
    }

    async fn prune_below(&self, number: i64) -> Result<usize, Error> {
        let mut rounds = self.rounds.write();
        let kept = rounds.split_off(&number);
        let pruned = rounds.len();
        *rounds = kept;
        Ok(pruned)
    }
}
