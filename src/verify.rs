use std::collections::{HashMap, HashSet};

use crate::{account, block};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("block not notarized: {valid} valid tickets, {required} required")]
    NotNotarized { valid: usize, required: usize },
    #[error("malformed block: {0}")]
    Block(#[from] block::Error),
}

/// Notarization and structure checks the sync engine consumes.
pub trait Verifier: Send + Sync {
    fn verify_notarization(&self, hash: &str, tickets: &[block::Ticket]) -> Result<(), Error>;

    fn validate_block(&self, b: &block::Block) -> Result<(), Error> {
        Ok(b.validate()?)
    }
}

/// Counts distinct known signers with a valid signature over the block hash.
#[derive(Debug, Clone)]
pub struct ThresholdVerifier {
    keys: HashMap<account::NodeId, account::PublicKey>,
    threshold: u32,
}

impl ThresholdVerifier {
    /// `threshold` is the percentage of the signer set required, 1..=100.
    pub fn new(keys: impl IntoIterator<Item = account::PublicKey>, threshold: u32) -> Self {
        let keys = keys.into_iter().map(|pk| (account::id_of(&pk), pk)).collect();
        Self { keys, threshold: threshold.clamp(1, 100) }
    }

    pub fn required(&self) -> usize {
        let n = self.keys.len() as u64;
        (((n * self.threshold as u64) + 99) / 100).max(1) as usize
    }
}

impl Verifier for ThresholdVerifier {
    fn verify_notarization(&self, hash: &str, tickets: &[block::Ticket]) -> Result<(), Error> {
        let required = self.required();
        let mut signers = HashSet::new();
        for ticket in tickets {
            if signers.contains(ticket.signer.as_str()) {
                continue;
            }
            let Some(pk) = self.keys.get(&ticket.signer) else { continue };
            if account::verify_hash(pk, hash, &ticket.signature) {
                signers.insert(ticket.signer.as_str());
                if signers.len() >= required {
                    return Ok(());
                }
            }
        }
        Err(Error::NotNotarized { valid: signers.len(), required })
    }
}
