use serde::{Serialize, Deserialize};

use crate::block;

/// One unit of consensus height, as seen by this sharder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Round {
    pub number: i64,
    pub block_hash: String,
    pub random_seed: u64,
    pub rank: i32,
    pub finalized: bool,
    // candidate blocks seen before finalization, never persisted
    #[serde(skip)]
    candidates: Vec<(String, i32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("block for round {got} offered to round {want}")]
    WrongRound { want: i64, got: i64 },
    #[error("round {round} already finalized with {hash}")]
    Conflict { round: i64, hash: String },
}

impl Round {
    pub fn new(number: i64) -> Self {
        Self { number, ..Default::default() }
    }

    pub fn genesis() -> Self {
        let mut r = Self::new(0);
        r.finalize(&block::Block::genesis());
        r
    }

    /// A stored round only counts if it is finalized and names its block.
    pub fn is_valid(&self) -> bool {
        self.finalized && !self.block_hash.is_empty()
    }

    /// Registers a candidate block; rejects anything that contradicts a finalized round.
    pub fn add_block(&mut self, b: &block::Block) -> Result<(), Error> {
        if b.round != self.number {
            return Err(Error::WrongRound { want: self.number, got: b.round });
        }
        if self.finalized {
            if self.block_hash == b.hash {
                return Ok(());
            }
            return Err(Error::Conflict { round: self.number, hash: self.block_hash.clone() });
        }
        if !self.candidates.iter().any(|(h, _)| h == &b.hash) {
            self.candidates.push((b.hash.clone(), b.round_rank));
        }
        Ok(())
    }

    /// Best (lowest) rank among the candidates seen so far.
    pub fn best_rank(&self) -> Option<i32> {
        self.candidates.iter().map(|(_, r)| *r).min()
    }

    pub fn finalize(&mut self, b: &block::Block) {
        self.block_hash = b.hash.clone();
        self.random_seed = b.random_seed;
        self.rank = b.round_rank;
        self.finalized = true;
        self.candidates.clear();
    }
}
