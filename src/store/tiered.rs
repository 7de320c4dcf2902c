use std::sync::Arc;

use async_trait::async_trait;

use super::{BlockStore, Error};
use crate::block;

/// Local hot tier in front of a remote cold tier.
pub struct TieredBlockStore {
    hot: Arc<dyn BlockStore>,
    cold: Arc<dyn BlockStore>,
    delete_local: bool,
}

impl TieredBlockStore {
    pub fn new(hot: Arc<dyn BlockStore>, cold: Arc<dyn BlockStore>, delete_local: bool) -> Self {
        Self { hot, cold, delete_local }
    }

    pub async fn cold_exists(&self, hash: &str) -> bool {
        self.cold.exists(hash).await
    }

    /// Copies a block from the hot tier into cold storage, dropping the local
    /// copy afterwards when configured to.
    pub async fn upload(&self, hash: &str, round: i64) -> Result<(), Error> {
        let b = self.hot.read(hash, round).await?;
        self.cold.write(&b).await?;
        if self.delete_local {
            self.hot.delete(hash, round).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for TieredBlockStore {
    async fn write(&self, b: &block::Block) -> Result<(), Error> {
        self.hot.write(b).await
    }

    async fn read(&self, hash: &str, round: i64) -> Result<block::Block, Error> {
        match self.hot.read(hash, round).await {
            Ok(b) => Ok(b),
            Err(e) if e.is_not_found() => self.cold.read(hash, round).await,
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, hash: &str) -> bool {
        self.hot.exists(hash).await || self.cold.exists(hash).await
    }

    async fn delete(&self, hash: &str, round: i64) -> Result<(), Error> {
        self.hot.delete(hash, round).await
    }
}
