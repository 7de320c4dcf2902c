use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{BlockStore, Error};
use crate::block;

/// Cold tier behind an object-store style HTTP endpoint: `PUT/GET/HEAD/DELETE <base>/<hash>`.
#[derive(Debug, Clone)]
pub struct HttpBlockStore {
    client: reqwest::Client,
    base: String,
}

impl HttpBlockStore {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base: base.trim_end_matches('/').to_string() })
    }

    fn url(&self, hash: &str) -> String {
        format!("{}/{}", self.base, hash)
    }
}

#[async_trait]
impl BlockStore for HttpBlockStore {
    async fn write(&self, b: &block::Block) -> Result<(), Error> {
        let resp = self.client.put(self.url(&b.hash)).json(b).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Status(resp.status()));
        }
        Ok(())
    }

    async fn read(&self, hash: &str, _round: i64) -> Result<block::Block, Error> {
        let resp = self.client.get(self.url(hash)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(hash.to_string())),
            s if !s.is_success() => Err(Error::Status(s)),
            _ => Ok(resp.json().await?),
        }
    }

    async fn exists(&self, hash: &str) -> bool {
        match self.client.head(self.url(hash)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn delete(&self, hash: &str, _round: i64) -> Result<(), Error> {
        let resp = self.client.delete(self.url(hash)).send().await?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(Error::Status(s)),
        }
    }
}
