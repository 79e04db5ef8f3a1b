//! offline-sync - keeps a local cache of a web application bundle in step
//! with its deployed resource manifest.
//!
//! A [`Synchronizer`] is one deployed version of the bundle. Installing it
//! fetches the application shell (the core set) into a staging partition;
//! activating it promotes the shell into the served cache, reusing every
//! cached resource whose content hash did not change. While active it
//! answers requests for manifest resources from the cache.
//!
//! # Example
//!
//! ```no_run
//! use offline_sync::{
//!     BuildManifest, HttpFetcher, MemoryCacheStorage, NoClients, Request, SyncConfig,
//!     Synchronizer,
//! };
//!
//! # async fn example() -> offline_sync::Result<()> {
//! let build = BuildManifest::load("build-manifest.json".as_ref())?;
//! let sync = Synchronizer::new(
//!     SyncConfig::new("https://app.example.com"),
//!     build,
//!     MemoryCacheStorage::new(),
//!     HttpFetcher::with_defaults()?,
//!     NoClients,
//! );
//!
//! sync.install().await?;
//! let outcome = sync.activate().await?;
//! println!("{outcome:?}");
//!
//! let request = Request::get("https://app.example.com/main.dart.js?v=42");
//! if let Some(response) = sync.handle_fetch(&request).await? {
//!     println!("served {} bytes", response.body.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod key;
pub mod lifecycle;
pub mod manifest;
pub mod stats;
pub mod storage;
pub mod sync;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "server")]
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use config::{AppConfig, PartitionNames, SyncConfig};
pub use error::{Error, Result};
pub use fetch::{Fetcher, HttpFetcher};
pub use http::{CacheMode, Method, Request, Response};
pub use key::{canonical_url, content_key, derive_key};
pub use lifecycle::{
    ClientControl, ControlMessage, Event, EventOutcome, MessageOutcome, NoClients, WorkerState,
};
pub use manifest::{BuildManifest, CoreSet, ROOT_KEY, ResourceKey, ResourceManifest};
pub use stats::{ActivationKind, ActivationOutcome, ActivationReport, OfflineReport};
pub use storage::{CacheStorage, DiskCacheStorage, MemoryCacheStorage};
pub use sync::{NoProgress, SyncProgress, Synchronizer};
