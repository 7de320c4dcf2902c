use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::fmt::Debug;

use crate::account;

/// Address of the miner smart contract that registration transactions go to.
pub const MINER_SC_ADDRESS: &str =
    "6dba10422e368813802877a85039d3985d96760ed844092319743fb3a76712d9";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Txn {
    pub hash: String,
    pub client_id: account::NodeId,
    pub public_key: String,
    pub to_client_id: String,
    pub value: u64,
    pub data: String,
    pub creation: i64,
    pub signature: String,
}

/// Payload of a smart contract call, carried json-encoded in `Txn::data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScData {
    pub name: String,
    pub input: serde_json::Value,
}

/// What the sharder keeps per transaction once its block is finalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub hash: String,
    pub block_hash: String,
    pub round: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("transaction hash mismatch")]
    BadHash,
    #[error("bad public key")]
    BadFromPk,
    #[error("client id does not match public key")]
    BadClientId,
    #[error("bad signature")]
    BadSig,
}

impl Txn {
    pub fn new(kp: &account::Keypair, to_client_id: &str, value: u64, data: String) -> Self {
        let mut txn = Self {
            hash: String::new(),
            client_id: kp.id(),
            public_key: kp.public_hex(),
            to_client_id: to_client_id.to_string(),
            value,
            data,
            creation: chrono::Utc::now().timestamp(),
            signature: String::new(),
        };
        txn.hash = txn.compute_hash();
        txn.signature = kp.sign_hash(&txn.hash);
        txn
    }

    pub fn smart_contract(kp: &account::Keypair, to_client_id: &str, name: &str, input: serde_json::Value) -> Self {
        let data = ScData { name: name.to_string(), input };
        let data = serde_json::to_string(&data).expect("sc data serializes");
        Self::new(kp, to_client_id, 0, data)
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.client_id.as_bytes());
        hasher.update(self.to_client_id.as_bytes());
        hasher.update(self.value.to_be_bytes());
        hasher.update(self.creation.to_be_bytes());
        hasher.update(Sha256::digest(self.data.as_bytes()));
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> Result<(), Error> {
        if self.hash != self.compute_hash() {
            return Err(Error::BadHash);
        }
        let pk = account::public_key_from_hex(&self.public_key).map_err(|_| Error::BadFromPk)?;
        if account::id_of(&pk) != self.client_id {
            return Err(Error::BadClientId);
        }
        if !account::verify_hash(&pk, &self.hash, &self.signature) {
            return Err(Error::BadSig);
        }
        Ok(())
    }

    pub fn summary(&self, block_hash: &str, round: i64) -> Summary {
        Summary { hash: self.hash.clone(), block_hash: block_hash.to_string(), round }
    }
}
