use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{BlockStore, Error};
use crate::block;

/// Writes go to every backend; reads are served by the first that has the block.
pub struct MultiBlockStore {
    stores: Vec<Arc<dyn BlockStore>>,
}

impl MultiBlockStore {
    pub fn new(stores: Vec<Arc<dyn BlockStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl BlockStore for MultiBlockStore {
    async fn write(&self, b: &block::Block) -> Result<(), Error> {
        let results = futures::future::join_all(self.stores.iter().map(|s| s.write(b))).await;
        let mut first_err = None;
        for res in results {
            if let Err(e) = res {
                warn!(round = b.round, hash = %b.hash, error = %e, "multi store write failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn read(&self, hash: &str, round: i64) -> Result<block::Block, Error> {
        let mut last = Error::NotFound(hash.to_string());
        for store in &self.stores {
            match store.read(hash, round).await {
                Ok(b) => return Ok(b),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    async fn exists(&self, hash: &str) -> bool {
        for store in &self.stores {
            if store.exists(hash).await {
                return true;
            }
        }
        false
    }

    async fn delete(&self, hash: &str, round: i64) -> Result<(), Error> {
        for store in &self.stores {
            store.delete(hash, round).await?;
        }
        Ok(())
    }
}
