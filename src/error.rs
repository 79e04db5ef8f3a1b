//! Error types for the offline-sync library.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::WorkerState;

/// Errors that can occur while synchronizing or serving the offline cache.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error (connection refused, DNS failure, reset, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Network failure reported by a non-HTTP fetcher.
    #[error("Network error for {url}: {reason}")]
    Network {
        /// URL that could not be fetched.
        url: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A resource required at install time came back with a non-ok status.
    #[error("Fetch of {url} returned status {status}")]
    BadStatus {
        /// URL that was fetched.
        url: String,
        /// HTTP status code of the response.
        status: u16,
    },

    /// A fetch did not settle within the configured bound.
    #[error("Fetch of {url} timed out after {after:?}")]
    Timeout {
        /// URL that was fetched.
        url: String,
        /// The bound that elapsed.
        after: Duration,
    },

    /// I/O error during disk cache operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Cache storage is missing data it should have or holds corrupt data.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The resource manifest or core set is malformed.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// A lifecycle transition was requested from the wrong state.
    #[error("Cannot move from {from} to {to}")]
    InvalidTransition {
        /// State the instance was in.
        from: WorkerState,
        /// State that was requested.
        to: WorkerState,
    },
}

impl Error {
    /// Builds a [`Error::Network`] from anything printable.
    pub fn network(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// A specialized `Result` type for offline-sync operations.
pub type Result<T> = std::result::Result<T, Error>;
