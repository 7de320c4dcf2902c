use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BlockStore, Error};
use crate::block;

#[derive(Debug, Default)]
pub struct MemBlockStore {
    blocks: RwLock<HashMap<String, block::Block>>,
}

impl MemBlockStore {
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl BlockStore for MemBlockStore {
    async fn write(&self, b: &block::Block) -> Result<(), Error> {
        self.blocks.write().insert(b.hash.clone(), b.clone());
        Ok(())
    }

    async fn read(&self, hash: &str, _round: i64) -> Result<block::Block, Error> {
        self.blocks
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::NotFound(hash.to_string()))
    }

    async fn exists(&self, hash: &str) -> bool {
        self.blocks.read().contains_key(hash)
    }

    async fn delete(&self, hash: &str, _round: i64) -> Result<(), Error> {
        self.blocks.write().remove(hash);
        Ok(())
    }
}
