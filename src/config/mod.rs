//! Configuration types for the synchronizer and the `osync` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Names of the three cache partitions the synchronizer owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionNames {
    /// Durable, served cache keyed by resource.
    pub content: String,
    /// Staging area for the core set between install and activate.
    pub temp: String,
    /// Holds the manifest that matches `content`.
    pub manifest: String,
}

impl Default for PartitionNames {
    fn default() -> Self {
        Self {
            content: "app-cache".to_string(),
            temp: "app-temp-cache".to_string(),
            manifest: "app-manifest".to_string(),
        }
    }
}

/// Runtime configuration for a [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Origin the manifest keys are relative to, without a trailing slash.
    pub origin: String,
    /// Partition names.
    pub partitions: PartitionNames,
    /// Upper bound for each eager fetch (install and offline download).
    /// `None` waits forever.
    pub fetch_timeout: Option<Duration>,
    /// Number of concurrent fetches during install and offline download.
    pub concurrent_fetches: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost".to_string(),
            partitions: PartitionNames::default(),
            fetch_timeout: Some(Duration::from_secs(30)),
            concurrent_fetches: 4,
        }
    }
}

impl SyncConfig {
    /// Creates a new configuration for the given origin.
    ///
    /// A trailing `/` on the origin is dropped.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self::default().with_origin(origin)
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        self.origin = origin.trim_end_matches('/').to_string();
        self
    }

    /// Sets the partition names.
    #[must_use]
    pub fn with_partitions(mut self, partitions: PartitionNames) -> Self {
        self.partitions = partitions;
        self
    }

    /// Sets the eager fetch timeout.
    #[must_use]
    pub const fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the number of concurrent fetches. Zero is treated as one.
    #[must_use]
    pub const fn with_concurrent_fetches(mut self, concurrent: usize) -> Self {
        self.concurrent_fetches = if concurrent == 0 { 1 } else { concurrent };
        self
    }
}

/// Synchronizer settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub origin: String,
    pub fetch_timeout_secs: Option<u64>,
    pub concurrent_fetches: usize,
    pub partitions: PartitionNames,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            origin: defaults.origin,
            fetch_timeout_secs: defaults.fetch_timeout.map(|d| d.as_secs()),
            concurrent_fetches: defaults.concurrent_fetches,
            partitions: defaults.partitions,
        }
    }
}

impl SyncSection {
    /// Converts the file representation into a runtime [`SyncConfig`].
    #[must_use]
    pub fn to_sync_config(&self) -> SyncConfig {
        SyncConfig::new(self.origin.clone())
            .with_partitions(self.partitions.clone())
            .with_fetch_timeout(self.fetch_timeout_secs.map(Duration::from_secs))
            .with_concurrent_fetches(self.concurrent_fetches)
    }
}

/// Local proxy server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9724,
        }
    }
}

/// Complete application configuration, read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path of the build manifest bundle (`{"resources": .., "core": ..}`).
    pub manifest_path: PathBuf,
    /// Directory backing the disk cache storage.
    pub cache_dir: PathBuf,
    pub sync: SyncSection,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            manifest_path: PathBuf::from("build-manifest.json"),
            cache_dir: data_dir.join("offline-sync").join("cache"),
            sync: SyncSection::default(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline-sync")
            .join("config.toml")
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
