//! Test doubles for the storage, network and host seams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::http::{Request, Response};
use crate::lifecycle::ClientControl;
use crate::storage::{CacheStorage, MemoryCacheStorage};

/// Scripted network outcome for one URL.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, Bytes),
    Fail,
    Hang,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::Status(200, Bytes::from(body.into()))
    }
}

/// Fetcher answering from a URL table. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct MockFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Request>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, reply: Reply) -> Self {
        self.set(url, reply);
        self
    }

    pub fn set(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.calls.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().get(&request.url).cloned();
        match reply {
            Some(Reply::Status(status, body)) => Ok(Response::new(status, body)),
            Some(Reply::Fail) => Err(Error::network(&request.url, "connection refused")),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(Response::new(404, "not found")),
        }
    }
}

/// Storage operation that [`FailingStorage`] can be told to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Open,
    Lookup,
    Put,
    Delete,
    Keys,
}

/// Memory storage that fails a chosen operation on a chosen partition.
#[derive(Debug, Default)]
pub struct FailingStorage {
    pub inner: MemoryCacheStorage,
    fail_on: Mutex<Option<(StorageOp, String)>>,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: StorageOp, partition: &str) {
        *self.fail_on.lock().unwrap() = Some((op, partition.to_string()));
    }

    pub fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    fn check(&self, op: StorageOp, partition: &str) -> Result<()> {
        match &*self.fail_on.lock().unwrap() {
            Some((o, p)) if *o == op && p == partition => {
                Err(Error::Storage(format!("injected {op:?} failure on {partition}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CacheStorage for FailingStorage {
    async fn open(&self, partition: &str) -> Result<()> {
        self.check(StorageOp::Open, partition)?;
        self.inner.open(partition).await
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        self.inner.has_partition(partition).await
    }

    async fn lookup(&self, partition: &str, url: &str) -> Result<Option<Response>> {
        self.check(StorageOp::Lookup, partition)?;
        self.inner.lookup(partition, url).await
    }

    async fn put(&self, partition: &str, url: &str, response: Response) -> Result<()> {
        self.check(StorageOp::Put, partition)?;
        self.inner.put(partition, url, response).await
    }

    async fn delete(&self, partition: &str, url: &str) -> Result<bool> {
        self.check(StorageOp::Delete, partition)?;
        self.inner.delete(partition, url).await
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        self.inner.delete_partition(partition).await
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        self.check(StorageOp::Keys, partition)?;
        self.inner.keys(partition).await
    }
}

/// Host double counting skip-waiting and claim calls.
#[derive(Debug, Default)]
pub struct RecordingClients {
    skips: AtomicUsize,
    claims: AtomicUsize,
}

impl RecordingClients {
    pub fn skips(&self) -> usize {
        self.skips.load(Ordering::SeqCst)
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }
}

impl ClientControl for RecordingClients {
    fn skip_waiting(&self) {
        self.skips.fetch_add(1, Ordering::SeqCst);
    }

    fn claim(&self) {
        self.claims.fetch_add(1, Ordering::SeqCst);
    }
}
