use ed25519_dalek::{self, Verifier, Signer};
use rand::rngs::OsRng;
use sha2::{Sha256, Digest};
use std::path::Path;

pub type NodeId = String;
pub type PublicKey = ed25519_dalek::PublicKey;
pub type Signature = ed25519_dalek::Signature;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading keys file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("malformed keys file: {0}")]
    Malformed(&'static str),
    #[error("bad key material: {0}")]
    Key(#[from] ed25519_dalek::SignatureError),
    #[error("bad hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Node ids are the hex sha256 of the raw public key.
pub fn id_of(pk: &PublicKey) -> NodeId {
    hex::encode(Sha256::digest(pk.as_bytes()))
}

pub fn public_key_from_hex(s: &str) -> Result<PublicKey, Error> {
    Ok(PublicKey::from_bytes(&hex::decode(s)?)?)
}

pub fn signature_from_hex(s: &str) -> Result<Signature, Error> {
    let bytes = hex::decode(s)?;
    Ok(Signature::try_from(bytes.as_slice())?)
}

/// Checks a hex signature over the raw bytes of a hex content hash.
pub fn verify_hash(pk: &PublicKey, hash: &str, sig: &str) -> bool {
    let (Ok(msg), Ok(sig)) = (hex::decode(hash), signature_from_hex(sig)) else {
        return false;
    };
    pk.verify(&msg, &sig).is_ok()
}

#[derive(Debug)]
pub struct Keypair {
    pub kp: ed25519_dalek::Keypair
}

impl Keypair {
    pub fn gen() -> Self {
        let mut csprng = OsRng {};
        Self { kp: ed25519_dalek::Keypair::generate(&mut csprng) }
    }

    /// Keys file: public key hex on the first line, secret key hex on the second.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let public = lines.next().ok_or(Error::Malformed("missing public key"))?;
        let secret = lines.next().ok_or(Error::Malformed("missing secret key"))?;
        let secret = ed25519_dalek::SecretKey::from_bytes(&hex::decode(secret)?)?;
        let derived = PublicKey::from(&secret);
        if hex::encode(derived.as_bytes()) != public.to_lowercase() {
            return Err(Error::Malformed("public key does not match secret key"));
        }
        Ok(Self { kp: ed25519_dalek::Keypair { secret, public: derived } })
    }

    pub fn to_file_contents(&self) -> String {
        format!(
            "{}\n{}\n",
            hex::encode(self.kp.public.as_bytes()),
            hex::encode(self.kp.secret.as_bytes())
        )
    }

    pub fn id(&self) -> NodeId {
        id_of(&self.kp.public)
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.kp.public.as_bytes())
    }

    /// Signs the raw bytes behind a hex content hash, returning hex.
    pub fn sign_hash(&self, hash: &str) -> String {
        let msg = hex::decode(hash).unwrap_or_else(|_| hash.as_bytes().to_vec());
        hex::encode(self.kp.sign(&msg).to_bytes())
    }
}
