use std::path::Path;

use async_trait::async_trait;

use super::{BlockStore, Error};
use crate::block;

/// Blocks in an embedded sled tree keyed by hash.
#[derive(Debug, Clone)]
pub struct KvBlockStore {
    db: sled::Db,
    blocks: sled::Tree,
}

impl KvBlockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        Ok(Self { db, blocks })
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for KvBlockStore {
    async fn write(&self, b: &block::Block) -> Result<(), Error> {
        self.blocks.insert(b.hash.as_bytes(), serde_json::to_vec(b)?)?;
        Ok(())
    }

    async fn read(&self, hash: &str, _round: i64) -> Result<block::Block, Error> {
        let bytes = self
            .blocks
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::NotFound(hash.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn exists(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash.as_bytes()).unwrap_or(false)
    }

    async fn delete(&self, hash: &str, _round: i64) -> Result<(), Error> {
        self.blocks.remove(hash.as_bytes())?;
        Ok(())
    }
}
