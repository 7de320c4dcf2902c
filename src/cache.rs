use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::{block, txn};

// txn summary slots per cached block
const TXNS_PER_BLOCK: usize = 64;

/// Recently finalized blocks and their transaction summaries.
#[derive(Debug)]
pub struct Cache {
    blocks: Mutex<LruCache<String, Arc<block::Block>>>,
    txns: Mutex<LruCache<String, txn::Summary>>,
}

impl Cache {
    pub fn new(size: usize) -> Self {
        let blocks = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        let txns = NonZeroUsize::new(size.saturating_mul(TXNS_PER_BLOCK)).unwrap_or(NonZeroUsize::MIN);
        Self {
            blocks: Mutex::new(LruCache::new(blocks)),
            txns: Mutex::new(LruCache::new(txns)),
        }
    }

    pub fn add(&self, b: Arc<block::Block>) {
        {
            let mut txns = self.txns.lock();
            for summary in b.txn_summaries() {
                txns.put(summary.hash.clone(), summary);
            }
        }
        self.blocks.lock().put(b.hash.clone(), b);
    }

    pub fn block(&self, hash: &str) -> Option<Arc<block::Block>> {
        self.blocks.lock().get(hash).cloned()
    }

    pub fn txn_summary(&self, hash: &str) -> Option<txn::Summary> {
        self.txns.lock().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}
