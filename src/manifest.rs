//! Resource manifest, core set and the build step that produces them.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Key of the site root document.
pub const ROOT_KEY: &str = "/";

/// File that the root key maps to in a generated manifest.
const INDEX_FILE: &str = "index.html";

/// Canonical, origin-relative identity of a cacheable resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Creates a key from an origin-relative path. An empty path is the root.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.is_empty() {
            Self::root()
        } else {
            Self(key)
        }
    }

    /// The root sentinel key `"/"`.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_KEY.to_string())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_KEY
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Immutable mapping from resource key to content hash.
///
/// Serializes as a flat JSON object, which is also the form persisted in the
/// manifest partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceManifest {
    entries: BTreeMap<ResourceKey, String>,
}

impl ResourceManifest {
    /// Builds a manifest from `(key, hash)` pairs.
    pub fn from_entries<K, H, I>(entries: I) -> Self
    where
        K: Into<ResourceKey>,
        H: Into<String>,
        I: IntoIterator<Item = (K, H)>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, h)| (k.into(), h.into()))
                .collect(),
        }
    }

    /// Returns the content hash recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a cached copy of `key` fetched under `stored` may be kept
    /// under this manifest: the key must exist in both with the same hash.
    #[must_use]
    pub fn is_reusable(&self, key: &ResourceKey, stored: &Self) -> bool {
        match (self.get(key), stored.get(key)) {
            (Some(current), Some(previous)) => current == previous,
            _ => false,
        }
    }

    /// Serializes the manifest to its JSON object form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a manifest from its JSON object form.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a JSON object of strings.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Ordered keys fetched eagerly at install (the application shell).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreSet(Vec<ResourceKey>);

impl CoreSet {
    pub fn new<K: Into<ResourceKey>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceKey> {
        self.0.iter()
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.0.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The build-time bundle: resource manifest plus core set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub resources: ResourceManifest,
    pub core: CoreSet,
}

impl BuildManifest {
    #[must_use]
    pub const fn new(resources: ResourceManifest, core: CoreSet) -> Self {
        Self { resources, core }
    }

    /// Checks that every core key is present in the resources.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] naming the first core key with no hash.
    pub fn validate(&self) -> Result<()> {
        if let Some(missing) = self.core.iter().find(|k| !self.resources.contains(k)) {
            return Err(Error::Manifest(format!(
                "core resource {missing} is not in the manifest"
            )));
        }
        Ok(())
    }

    /// Loads and validates a bundle from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let bundle: Self = serde_json::from_slice(&bytes)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Writes the bundle as pretty-printed JSON atomically (write tmp +
    /// rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Hashes every file under `build_dir` and returns a bundle whose core set
/// is `core`.
///
/// Keys are `/`-separated paths relative to `build_dir`. When an
/// `index.html` exists at the top level, the root key maps to its hash.
///
/// # Errors
///
/// Returns an error if the directory cannot be walked or a core key names a
/// file that was not found.
pub fn generate(build_dir: &Path, core: CoreSet) -> Result<BuildManifest> {
    let mut files = Vec::new();
    collect_files_recursive(build_dir, &mut files)?;

    let mut entries = BTreeMap::new();
    for path in files {
        let relative = path
            .strip_prefix(build_dir)
            .map_err(|e| Error::Manifest(e.to_string()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let hash = hash_file(&path)?;
        if key == INDEX_FILE {
            entries.insert(ResourceKey::root(), hash.clone());
        }
        entries.insert(ResourceKey::new(key), hash);
    }

    let bundle = BuildManifest::new(ResourceManifest { entries }, core);
    bundle.validate()?;
    log::info!(
        "Generated manifest for {} ({} resources, {} core)",
        build_dir.display(),
        bundle.resources.len(),
        bundle.core.len()
    );
    Ok(bundle)
}

/// Recursively collects regular files, sorted for stable output.
fn collect_files_recursive(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_files_recursive(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Lower-hex SHA-256 digest of a file's contents.
fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
