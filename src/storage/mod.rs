//! Cache storage abstraction.
//!
//! A storage holds named partitions, each a map from request URL to
//! [`Response`]. Every operation is atomic on its own; there are no
//! cross-key transactions.

mod disk;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::Response;

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

/// Key-value cache storage with named partitions.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Opens `partition`, creating it empty if it does not exist.
    async fn open(&self, partition: &str) -> Result<()>;

    /// Whether `partition` currently exists.
    async fn has_partition(&self, partition: &str) -> Result<bool>;

    /// Returns the response stored for `url`. A missing partition is a miss.
    async fn lookup(&self, partition: &str, url: &str) -> Result<Option<Response>>;

    /// Stores `response` under `url`, creating the partition if needed.
    async fn put(&self, partition: &str, url: &str, response: Response) -> Result<()>;

    /// Removes the entry for `url`. Returns whether one existed.
    async fn delete(&self, partition: &str, url: &str) -> Result<bool>;

    /// Removes `partition` and all of its entries. Returns whether it existed.
    async fn delete_partition(&self, partition: &str) -> Result<bool>;

    /// Lists the request URLs stored in `partition`.
    async fn keys(&self, partition: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl<T: CacheStorage + ?Sized> CacheStorage for Arc<T> {
    async fn open(&self, partition: &str) -> Result<()> {
        (**self).open(partition).await
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        (**self).has_partition(partition).await
    }

    async fn lookup(&self, partition: &str, url: &str) -> Result<Option<Response>> {
        (**self).lookup(partition, url).await
    }

    async fn put(&self, partition: &str, url: &str, response: Response) -> Result<()> {
        (**self).put(partition, url, response).await
    }

    async fn delete(&self, partition: &str, url: &str) -> Result<bool> {
        (**self).delete(partition, url).await
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        (**self).delete_partition(partition).await
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        (**self).keys(partition).await
    }
}
