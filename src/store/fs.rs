use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{BlockStore, Error};
use crate::block;

/// One json file per block, fanned out over two levels of hash-prefix directories.
#[derive(Debug, Clone)]
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    /// Nothing but a well-formed hash ever becomes part of a path.
    fn path(&self, hash: &str) -> Option<PathBuf> {
        if !block::is_hash(hash) {
            return None;
        }
        Some(self.root.join(&hash[0..2]).join(&hash[2..4]).join(format!("{}.json", hash)))
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn write(&self, b: &block::Block) -> Result<(), Error> {
        let path = self.path(&b.hash).ok_or_else(|| Error::BadKey(b.hash.clone()))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(b)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, hash: &str, _round: i64) -> Result<block::Block, Error> {
        let path = self.path(hash).ok_or_else(|| Error::NotFound(hash.to_string()))?;
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(hash.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let b: block::Block = serde_json::from_slice(&bytes)?;
        if b.hash != hash {
            return Err(Error::Corrupt { key: hash.to_string(), stored: b.hash });
        }
        Ok(b)
    }

    async fn exists(&self, hash: &str) -> bool {
        match self.path(hash) {
            Some(path) => fs::metadata(path).await.is_ok(),
            None => false,
        }
    }

    async fn delete(&self, hash: &str, _round: i64) -> Result<(), Error> {
        let Some(path) = self.path(hash) else { return Ok(()) };
        match fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
