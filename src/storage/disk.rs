//! Cache storage persisted to a directory tree.
//!
//! Layout: `<root>/<partition>/<digest>.json`, where `digest` is the
//! URL-safe base64 SHA-256 of the request URL and the file holds an
//! [`Envelope`] with the URL and the response.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CacheStorage;
use crate::error::{Error, Result};
use crate::http::Response;

const ENTRY_EXT: &str = "json";

#[derive(Serialize, Deserialize)]
struct Envelope {
    url: String,
    response: Response,
}

/// Cache storage backed by `tokio::fs`.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    /// Creates a storage rooted at `root`. Nothing is touched on disk until
    /// the first operation.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: &str) -> Result<PathBuf> {
        if partition.is_empty()
            || partition.starts_with('.')
            || partition.contains(['/', '\\'])
        {
            return Err(Error::Storage(format!("invalid partition name {partition:?}")));
        }
        Ok(self.root.join(partition))
    }

    fn entry_path(&self, partition: &str, url: &str) -> Result<PathBuf> {
        let digest = Sha256::digest(url.as_bytes());
        let name = format!("{}.{ENTRY_EXT}", URL_SAFE_NO_PAD.encode(digest));
        Ok(self.partition_dir(partition)?.join(name))
    }

    async fn read_envelope(path: &Path) -> Result<Option<Envelope>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Storage(format!("corrupt entry {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, partition: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.partition_dir(partition)?).await?;
        Ok(())
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        let dir = self.partition_dir(partition)?;
        Ok(tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()))
    }

    async fn lookup(&self, partition: &str, url: &str) -> Result<Option<Response>> {
        let path = self.entry_path(partition, url)?;
        Ok(Self::read_envelope(&path)
            .await?
            .filter(|env| env.url == url)
            .map(|env| env.response))
    }

    async fn put(&self, partition: &str, url: &str, response: Response) -> Result<()> {
        self.open(partition).await?;
        let path = self.entry_path(partition, url)?;
        let tmp_path = path.with_extension("json.tmp");

        let envelope = Envelope {
            url: url.to_string(),
            response,
        };
        tokio::fs::write(&tmp_path, serde_json::to_vec(&envelope)?).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, partition: &str, url: &str) -> Result<bool> {
        let path = self.entry_path(partition, url)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.partition_dir(partition)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        let dir = self.partition_dir(partition)?;
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut urls = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXT)
                && let Some(envelope) = Self::read_envelope(&path).await?
            {
                urls.push(envelope.url);
            }
        }
        urls.sort();
        Ok(urls)
    }
}
