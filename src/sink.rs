use tracing::debug;

use crate::{block, txn};

/// Receives a summary of every finalized block for the secondary projection.
pub trait Sink: Send + Sync {
    fn block_finalized(&self, summary: &block::Summary, txns: &[txn::Summary]);
}

/// Default sink: the projection lives elsewhere, so just trace what would be sent.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn block_finalized(&self, summary: &block::Summary, txns: &[txn::Summary]) {
        debug!(round = summary.round, hash = %summary.hash, txns = txns.len(), "block summary");
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Remembers every round it was handed.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub rounds: Mutex<Vec<i64>>,
    }

    impl Sink for RecordingSink {
        fn block_finalized(&self, summary: &block::Summary, _txns: &[txn::Summary]) {
            self.rounds.lock().push(summary.round);
        }
    }

    #[test]
    fn records() {
        let sink = RecordingSink::default();
        let b = block::Block::genesis();
        LogSink.block_finalized(&b.summary(), &b.txn_summaries());
        sink.block_finalized(&b.summary(), &b.txn_summaries());
        assert_eq!(*sink.rounds.lock(), vec![0]);
    }
}
