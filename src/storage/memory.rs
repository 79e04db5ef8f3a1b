//! In-process cache storage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CacheStorage;
use crate::error::Result;
use crate::http::Response;

type Partition = BTreeMap<String, Response>;

/// Cache storage kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl MemoryCacheStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, partition: &str) -> Result<()> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_default();
        Ok(())
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.partitions.read().await.contains_key(partition))
    }

    async fn lookup(&self, partition: &str, url: &str) -> Result<Option<Response>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .and_then(|p| p.get(url))
            .cloned())
    }

    async fn put(&self, partition: &str, url: &str, response: Response) -> Result<()> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_default()
            .insert(url.to_string(), response);
        Ok(())
    }

    async fn delete(&self, partition: &str, url: &str) -> Result<bool> {
        Ok(self
            .partitions
            .write()
            .await
            .get_mut(partition)
            .is_some_and(|p| p.remove(url).is_some()))
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.partitions.write().await.remove(partition).is_some())
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }
}
