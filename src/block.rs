use serde::{Serialize, Deserialize};
use sha2::Sha256;
use digest::Digest;
use std::collections::HashSet;

use crate::account;
use crate::txn;

pub const MAX_BLOCK_SIZE: usize = 1024;

pub const GENESIS_HASH: &str = "ed79cae70d439c11258236da1dfa6fc550f7cc569768304623e8fbd7d70efae4";

/// Block hashes are hex sha256: 64 lowercase hex digits and nothing else.
pub fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
}

/// A verification ticket: one consensus participant's signature over a block hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub signer: account::NodeId,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub round: i64,
    pub hash: String,
    pub prev_hash: String,
    pub miner_id: account::NodeId,
    pub round_rank: i32,
    pub random_seed: u64,
    pub state_hash: String,
    pub creation: i64,
    pub txns: Vec<txn::Txn>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
}

/// The per-block record handed to the event projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub hash: String,
    pub round: i64,
    pub prev_hash: String,
    pub miner_id: account::NodeId,
    pub state_hash: String,
    pub round_rank: i32,
    pub num_txns: usize,
    pub creation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("block hash does not match contents")]
    BadHash,
    #[error("negative round")]
    BadRound,
    #[error("missing previous block hash")]
    NoPrev,
    #[error("block has {0} transactions")]
    TooBig(usize),
    #[error("duplicate transaction {0}")]
    DuplicateTxn(String),
    #[error("invalid transaction {0}: {1}")]
    BadTxn(String, txn::Error),
}

impl Block {
    pub fn genesis() -> Self {
        Self {
            round: 0,
            hash: GENESIS_HASH.to_string(),
            prev_hash: String::new(),
            miner_id: String::new(),
            round_rank: 0,
            random_seed: 839695260482366273,
            state_hash: String::new(),
            creation: 0,
            txns: Vec::new(),
            tickets: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.round == 0 && self.hash == GENESIS_HASH
    }

    pub fn txns_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for txn in &self.txns {
            hasher.update(txn.hash.as_bytes());
        }
        hasher.finalize().into()
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.miner_id.as_bytes());
        hasher.update(self.round_rank.to_be_bytes());
        hasher.update(self.random_seed.to_be_bytes());
        hasher.update(self.state_hash.as_bytes());
        hasher.update(self.creation.to_be_bytes());
        hasher.update(self.txns_hash());
        hex::encode(hasher.finalize())
    }

    /// Structural checks only; notarization is the verifier's job.
    pub fn validate(&self) -> Result<(), Error> {
        if self.is_genesis() {
            return Ok(());
        }
        if self.round < 0 {
            return Err(Error::BadRound);
        }
        if self.prev_hash.is_empty() {
            return Err(Error::NoPrev);
        }
        if self.txns.len() > MAX_BLOCK_SIZE {
            return Err(Error::TooBig(self.txns.len()));
        }
        if self.hash != self.compute_hash() {
            return Err(Error::BadHash);
        }
        let mut seen = HashSet::with_capacity(self.txns.len());
        for txn in &self.txns {
            if !seen.insert(txn.hash.as_str()) {
                return Err(Error::DuplicateTxn(txn.hash.clone()));
            }
            txn.verify().map_err(|e| Error::BadTxn(txn.hash.clone(), e))?;
        }
        Ok(())
    }

    pub fn summary(&self) -> Summary {
        Summary {
            hash: self.hash.clone(),
            round: self.round,
            prev_hash: self.prev_hash.clone(),
            miner_id: self.miner_id.clone(),
            state_hash: self.state_hash.clone(),
            round_rank: self.round_rank,
            num_txns: self.txns.len(),
            creation: self.creation,
        }
    }

    pub fn txn_summaries(&self) -> Vec<txn::Summary> {
        self.txns.iter().map(|t| t.summary(&self.hash, self.round)).collect()
    }
}

/// Assembles a block on top of a parent, the way a miner would.
#[derive(Debug, Clone)]
pub struct Builder {
    pub round: i64,
    pub prev_hash: String,
    pub round_rank: i32,
    pub random_seed: u64,
    pub state_hash: String,
    pub txns: Vec<txn::Txn>,
}

impl Builder {
    pub fn new(prev: &Block) -> Self {
        Self::at(prev.round + 1, &prev.hash)
    }

    pub fn at(round: i64, prev_hash: &str) -> Self {
        let digest = Sha256::digest(format!("{}{}", round, prev_hash));
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        Self {
            round,
            prev_hash: prev_hash.to_string(),
            round_rank: 0,
            random_seed: u64::from_be_bytes(seed),
            state_hash: hex::encode(Sha256::digest(round.to_be_bytes())),
            txns: Vec::new(),
        }
    }

    pub fn add(&mut self, txn: txn::Txn) -> &mut Self {
        self.txns.push(txn);
        self
    }

    pub fn finalize(self, miner: &account::Keypair) -> Block {
        let mut block = Block {
            round: self.round,
            hash: String::new(),
            prev_hash: self.prev_hash,
            miner_id: miner.id(),
            round_rank: self.round_rank,
            random_seed: self.random_seed,
            state_hash: self.state_hash,
            creation: chrono::Utc::now().timestamp(),
            txns: self.txns,
            tickets: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Finalizes and attaches a verification ticket from every signer.
    pub fn notarize(self, miner: &account::Keypair, signers: &[account::Keypair]) -> Block {
        let mut block = self.finalize(miner);
        block.tickets = signers
            .iter()
            .map(|kp| Ticket { signer: kp.id(), signature: kp.sign_hash(&block.hash) })
            .collect();
        block
    }
}
