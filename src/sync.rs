//! The offline cache synchronizer.
//!
//! One [`Synchronizer`] is one deployed version of the application bundle.
//! The host drives it through `install`, `activate`, `handle_fetch` and
//! `handle_message`; each returns a future the host must keep alive until
//! it settles.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::{StreamExt, TryStreamExt, stream};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, HttpFetcher, fetch_bounded};
use crate::http::{CacheMode, Method, Request, Response};
use crate::key::{canonical_url, content_key, derive_key};
use crate::lifecycle::{
    ClientControl, ControlMessage, Event, EventOutcome, MessageOutcome, NoClients, WorkerState,
};
use crate::manifest::{BuildManifest, ResourceKey, ResourceManifest};
use crate::stats::{
    ActivationKind, ActivationOutcome, ActivationReport, OfflineReport, OfflineReportBuilder,
};
use crate::storage::CacheStorage;

/// Entry name of the stored manifest inside the manifest partition.
const MANIFEST_ENTRY: &str = "manifest";

/// Receives per-resource updates during offline download.
///
/// All methods have default no-op implementations.
pub trait SyncProgress: Send + Sync {
    /// Called before a resource is fetched.
    fn on_resource_start(&self, _key: &ResourceKey) {}

    /// Called after a resource was stored.
    fn on_resource_cached(&self, _key: &ResourceKey, _bytes: u64) {}

    /// Called when a resource could not be cached.
    fn on_error(&self, _key: &ResourceKey, _error: &str) {}
}

/// A progress sink that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl SyncProgress for NoProgress {}

/// Keeps a cache of static resources consistent with one deployed
/// [`BuildManifest`] and serves intercepted requests from it.
pub struct Synchronizer<S, F = HttpFetcher, C = NoClients> {
    id: String,
    config: SyncConfig,
    build: BuildManifest,
    storage: S,
    fetcher: F,
    clients: C,
    state: Mutex<WorkerState>,
}

impl<S: CacheStorage, F: Fetcher, C: ClientControl> Synchronizer<S, F, C> {
    /// Creates an uninstalled instance for `build`.
    #[must_use]
    pub fn new(config: SyncConfig, build: BuildManifest, storage: S, fetcher: F, clients: C) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            build,
            storage,
            fetcher,
            clients,
            state: Mutex::new(WorkerState::Uninstalled),
        }
    }

    /// Creates an instance that is already active over a cache populated by
    /// an earlier activation of the same build.
    #[must_use]
    pub fn resume(
        config: SyncConfig,
        build: BuildManifest,
        storage: S,
        fetcher: F,
        clients: C,
    ) -> Self {
        let sync = Self::new(config, build, storage, fetcher, clients);
        sync.set_state(WorkerState::Active);
        sync
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub const fn build(&self) -> &BuildManifest {
        &self.build
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub const fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: WorkerState) {
        *self.lock_state() = next;
    }

    fn transition(&self, expected: WorkerState, next: WorkerState) -> Result<()> {
        let mut state = self.lock_state();
        if *state != expected {
            return Err(Error::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    fn manifest_url(&self) -> String {
        format!("{}/{MANIFEST_ENTRY}", self.config.origin)
    }

    // ------------------------------------------------------------------
    // Install
    // ------------------------------------------------------------------

    /// Fetches the core set from the origin and stages it for activation.
    ///
    /// The host is told to skip waiting before anything is fetched. Every
    /// core resource must come back ok; only then is anything staged. On
    /// failure the instance becomes [`WorkerState::Redundant`] and the
    /// previous version stays in charge.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance was already installed, or if any
    /// core fetch fails, returns a non-ok status, or times out.
    pub async fn install(&self) -> Result<()> {
        self.transition(WorkerState::Uninstalled, WorkerState::Installing)?;
        self.clients.skip_waiting();

        match self.stage_core_set().await {
            Ok(staged) => {
                self.set_state(WorkerState::Waiting);
                log::info!("Installed {} ({staged} core resources staged)", self.id);
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant);
                log::warn!("Install of {} failed: {e}", self.id);
                Err(e)
            }
        }
    }

    async fn stage_core_set(&self) -> Result<usize> {
        let origin = self.config.origin.as_str();
        let bound = self.config.fetch_timeout;

        let fetched: Vec<(String, Response)> = stream::iter(self.build.core.iter())
            .map(|key| async move {
                let url = canonical_url(key, origin);
                let request = Request::get(url.clone()).with_cache(CacheMode::Reload);
                let response = fetch_bounded(&self.fetcher, &request, bound).await?;
                if !response.is_ok() {
                    return Err(Error::BadStatus {
                        url,
                        status: response.status,
                    });
                }
                Ok::<_, Error>((url, response))
            })
            .buffered(self.config.concurrent_fetches.max(1))
            .try_collect()
            .await?;

        let temp = &self.config.partitions.temp;
        self.storage.open(temp).await?;
        for (url, response) in &fetched {
            self.storage.put(temp, url, response.clone()).await?;
        }
        Ok(fetched.len())
    }

    // ------------------------------------------------------------------
    // Activate
    // ------------------------------------------------------------------

    /// Promotes the staged core set into the content partition.
    ///
    /// Without a stored manifest the content partition is rebuilt from the
    /// staged resources. With one, cached entries whose key was removed or
    /// whose hash changed are evicted first. If any step fails, all three
    /// partitions are deleted and [`ActivationOutcome::Reset`] is returned.
    /// The instance is active afterwards in both cases.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not waiting, or if deleting the
    /// partitions after a failed step fails as well.
    pub async fn activate(&self) -> Result<ActivationOutcome> {
        self.transition(WorkerState::Waiting, WorkerState::Activating)?;

        match self.promote(Instant::now()).await {
            Ok(report) => {
                self.set_state(WorkerState::Active);
                self.clients.claim();
                log::info!(
                    "Activated {} ({:?}: {} kept, {} evicted, {} promoted)",
                    self.id,
                    report.kind,
                    report.kept,
                    report.evicted,
                    report.promoted
                );
                Ok(ActivationOutcome::Activated(report))
            }
            Err(cause) => {
                log::error!("Failed to upgrade cache for {}: {cause}", self.id);
                let discarded = self.discard_all().await;
                self.set_state(WorkerState::Active);
                discarded?;
                Ok(ActivationOutcome::Reset { cause })
            }
        }
    }

    async fn promote(&self, start: Instant) -> Result<ActivationReport> {
        let partitions = &self.config.partitions;
        self.storage.open(&partitions.content).await?;
        self.storage.open(&partitions.temp).await?;
        self.storage.open(&partitions.manifest).await?;

        let stored = self
            .storage
            .lookup(&partitions.manifest, &self.manifest_url())
            .await?;

        let (kind, kept, evicted) = match stored {
            None => {
                self.storage.delete_partition(&partitions.content).await?;
                self.storage.open(&partitions.content).await?;
                (ActivationKind::ColdStart, 0, 0)
            }
            Some(entry) => {
                let stored = ResourceManifest::from_json(&entry.body)?;
                let (kept, evicted) = self.evict_stale(&stored).await?;
                (ActivationKind::Upgrade, kept, evicted)
            }
        };

        let promoted = self.promote_staged().await?;
        self.storage.delete_partition(&partitions.temp).await?;
        self.store_manifest().await?;

        Ok(ActivationReport {
            kind,
            kept,
            evicted,
            promoted,
            elapsed: start.elapsed(),
        })
    }

    /// Deletes every cached entry that cannot be reused under the current
    /// manifest. Returns `(kept, evicted)`.
    async fn evict_stale(&self, stored: &ResourceManifest) -> Result<(usize, usize)> {
        let content = &self.config.partitions.content;
        let mut kept = 0;
        let mut evicted = 0;

        for url in self.storage.keys(content).await? {
            let key = content_key(&url, &self.config.origin);
            if self.build.resources.is_reusable(&key, stored) {
                kept += 1;
            } else {
                self.storage.delete(content, &url).await?;
                log::debug!("Evicted {key}");
                evicted += 1;
            }
        }
        Ok((kept, evicted))
    }

    /// Copies every staged entry into the content partition, replacing
    /// whatever is cached under the same URL.
    async fn promote_staged(&self) -> Result<usize> {
        let partitions = &self.config.partitions;
        let staged = self.storage.keys(&partitions.temp).await?;
        for url in &staged {
            let response = self
                .storage
                .lookup(&partitions.temp, url)
                .await?
                .ok_or_else(|| Error::Storage(format!("staged entry {url} disappeared")))?;
            self.storage.put(&partitions.content, url, response).await?;
        }
        Ok(staged.len())
    }

    async fn store_manifest(&self) -> Result<()> {
        let json = self.build.resources.to_json()?;
        let entry = Response::new(200, json).with_header("Content-Type", "application/json");
        self.storage
            .put(&self.config.partitions.manifest, &self.manifest_url(), entry)
            .await
    }

    async fn discard_all(&self) -> Result<()> {
        let partitions = &self.config.partitions;
        self.storage.delete_partition(&partitions.content).await?;
        self.storage.delete_partition(&partitions.temp).await?;
        self.storage.delete_partition(&partitions.manifest).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fetch interception
    // ------------------------------------------------------------------

    /// Answers an intercepted request, or declines it with `Ok(None)`.
    ///
    /// Only `GET` requests for keys in the manifest are answered. The root
    /// document is fetched online-first and every response the network
    /// returns replaces the cached copy; everything else is served from
    /// cache and fetched (and cached when ok) on a miss.
    ///
    /// # Errors
    ///
    /// Returns the network error when the resource is neither cached nor
    /// reachable.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Option<Response>> {
        if request.method != Method::Get {
            return Ok(None);
        }
        let key = derive_key(&request.url, &self.config.origin);
        if !self.build.resources.contains(&key) {
            log::trace!("Passing through {}", request.url);
            return Ok(None);
        }

        let url = canonical_url(&key, &self.config.origin);
        let response = if key.is_root() {
            self.online_first(request, &url).await?
        } else {
            self.cache_first(request, &url).await?
        };
        Ok(Some(response))
    }

    async fn cache_first(&self, request: &Request, url: &str) -> Result<Response> {
        let content = &self.config.partitions.content;
        if let Some(hit) = self.storage.lookup(content, url).await? {
            return Ok(hit);
        }

        let response = self.fetcher.fetch(request).await?;
        if response.is_ok() {
            self.store_content(url, &response).await;
        }
        Ok(response)
    }

    async fn online_first(&self, request: &Request, url: &str) -> Result<Response> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_content(url, &response).await;
                Ok(response)
            }
            Err(network_error) => {
                let content = &self.config.partitions.content;
                match self.storage.lookup(content, url).await {
                    Ok(Some(cached)) => {
                        log::debug!("Offline, serving cached {url}");
                        Ok(cached)
                    }
                    Ok(None) => Err(network_error),
                    Err(e) => {
                        log::warn!("Cache lookup for {url} failed: {e}");
                        Err(network_error)
                    }
                }
            }
        }
    }

    /// Stores a fetched response. A failed store does not fail the request.
    async fn store_content(&self, url: &str, response: &Response) {
        let content = &self.config.partitions.content;
        if let Err(e) = self.storage.put(content, url, response.clone()).await {
            log::warn!("Could not cache {url}: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Control messages
    // ------------------------------------------------------------------

    /// Handles a control message from a page.
    ///
    /// # Errors
    ///
    /// Returns an error if an offline download cannot read the cache.
    pub async fn handle_message(&self, payload: &str) -> Result<MessageOutcome> {
        match payload.parse::<ControlMessage>() {
            Ok(ControlMessage::SkipWaiting) => {
                self.clients.skip_waiting();
                Ok(MessageOutcome::SkippedWaiting)
            }
            Ok(ControlMessage::DownloadOffline) => self
                .download_offline(&NoProgress)
                .await
                .map(MessageOutcome::DownloadedOffline),
            Err(reason) => {
                log::debug!("Ignoring message: {reason}");
                Ok(MessageOutcome::Ignored)
            }
        }
    }

    /// Fetches and stores every manifest resource not yet in the content
    /// partition.
    ///
    /// Each resource is independent: failures are reported in the returned
    /// [`OfflineReport`] and do not stop the others. Resources cached before
    /// a failure stay cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the content partition cannot be listed.
    pub async fn download_offline(&self, progress: &dyn SyncProgress) -> Result<OfflineReport> {
        let mut builder = OfflineReportBuilder::new();

        let missing = self.missing_resources().await?;
        builder.set_already_cached(self.build.resources.len() - missing.len());

        let results: Vec<_> = stream::iter(missing)
            .map(|key| async move {
                progress.on_resource_start(&key);
                let result = self.cache_resource(&key).await;
                match &result {
                    Ok(bytes) => progress.on_resource_cached(&key, *bytes),
                    Err(e) => progress.on_error(&key, &e.to_string()),
                }
                (key, result)
            })
            .buffer_unordered(self.config.concurrent_fetches.max(1))
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(bytes) => builder.add_cached(bytes),
                Err(e) => {
                    log::warn!("Offline download of {key} failed: {e}");
                    builder.add_failure(key, e.to_string());
                }
            }
        }

        let report = builder.build();
        log::info!(
            "Offline download: {} cached, {} already present, {} failed",
            report.cached,
            report.already_cached,
            report.failed.len()
        );
        Ok(report)
    }

    /// Manifest keys that have no entry in the content partition, in key
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if the content partition cannot be listed.
    pub async fn missing_resources(&self) -> Result<Vec<ResourceKey>> {
        let origin = self.config.origin.as_str();
        let present: HashSet<ResourceKey> = self
            .storage
            .keys(&self.config.partitions.content)
            .await?
            .iter()
            .map(|url| content_key(url, origin))
            .collect();
        Ok(self
            .build
            .resources
            .keys()
            .filter(|key| !present.contains(*key))
            .cloned()
            .collect())
    }

    /// Fetches one resource and stores it. Returns the body size.
    async fn cache_resource(&self, key: &ResourceKey) -> Result<u64> {
        let url = canonical_url(key, &self.config.origin);
        let request = Request::get(url.clone());
        let response = fetch_bounded(&self.fetcher, &request, self.config.fetch_timeout).await?;
        if !response.is_ok() {
            return Err(Error::BadStatus {
                url,
                status: response.status,
            });
        }
        let bytes = response.body.len() as u64;
        self.storage
            .put(&self.config.partitions.content, &url, response)
            .await?;
        Ok(bytes)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Routes a host event to its handler.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error.
    pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
        match event {
            Event::Install => self.install().await.map(|()| EventOutcome::Installed),
            Event::Activate => self.activate().await.map(EventOutcome::Activated),
            Event::Fetch(request) => Ok(self
                .handle_fetch(&request)
                .await?
                .map_or(EventOutcome::Declined, EventOutcome::Responded)),
            Event::Message(payload) => self
                .handle_message(&payload)
                .await
                .map(EventOutcome::Message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::manifest::CoreSet;
    use crate::storage::MemoryCacheStorage;
    use crate::testing::{FailingStorage, MockFetcher, RecordingClients, Reply, StorageOp};

    const ORIGIN: &str = "https://app.test";

    type TestSync<S> = Synchronizer<Arc<S>, Arc<MockFetcher>, Arc<RecordingClients>>;

    fn url(key: &str) -> String {
        canonical_url(&ResourceKey::new(key), ORIGIN)
    }

    fn bundle(resources: &[(&str, &str)], core: &[&str]) -> BuildManifest {
        BuildManifest::new(
            ResourceManifest::from_entries(resources.iter().copied()),
            CoreSet::new(core.iter().copied()),
        )
    }

    fn config() -> SyncConfig {
        SyncConfig::new(ORIGIN).with_fetch_timeout(Some(Duration::from_millis(200)))
    }

    fn make<S: CacheStorage>(
        build: BuildManifest,
        storage: &Arc<S>,
        fetcher: &Arc<MockFetcher>,
    ) -> (TestSync<S>, Arc<RecordingClients>) {
        let clients = Arc::new(RecordingClients::default());
        let sync = Synchronizer::new(
            config(),
            build,
            Arc::clone(storage),
            Arc::clone(fetcher),
            Arc::clone(&clients),
        );
        (sync, clients)
    }

    async fn cycle<S: CacheStorage>(sync: &TestSync<S>) -> ActivationOutcome {
        sync.install().await.unwrap();
        sync.activate().await.unwrap()
    }

    async fn body_of<S: CacheStorage>(storage: &S, partition: &str, key: &str) -> Option<String> {
        storage
            .lookup(partition, &url(key))
            .await
            .unwrap()
            .map(|r| String::from_utf8(r.body.to_vec()).unwrap())
    }

    async fn content_keys<S: CacheStorage>(storage: &S) -> Vec<String> {
        let mut keys = storage.keys("app-cache").await.unwrap();
        keys.sort();
        keys
    }

    fn v1() -> BuildManifest {
        bundle(
            &[
                ("/", "i1"),
                ("index.html", "i1"),
                ("main.js", "m1"),
                ("a.png", "a1"),
                ("b.png", "b1"),
            ],
            &["index.html", "main.js"],
        )
    }

    fn shell_fetcher(tag: &str) -> MockFetcher {
        let fetcher = MockFetcher::new();
        for key in ["index.html", "main.js", "a.png", "b.png", "c.png", "/"] {
            fetcher.set(&url(key), Reply::ok(format!("{key} {tag}")));
        }
        fetcher
    }

    /// Runs v1 and lazily caches `a.png` and `b.png` through interception.
    async fn installed_v1(storage: &Arc<MemoryCacheStorage>) {
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), storage, &fetcher);
        cycle(&sync).await;
        for key in ["a.png", "b.png"] {
            sync.handle_fetch(&Request::get(url(key))).await.unwrap().unwrap();
        }
    }

    // =========================================================================
    // Install
    // =========================================================================

    #[tokio::test]
    async fn install_stages_core_with_reload_and_skips_waiting() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, clients) = make(v1(), &storage, &fetcher);

        sync.install().await.unwrap();

        assert_eq!(sync.state(), WorkerState::Waiting);
        assert_eq!(clients.skips(), 1);
        assert_eq!(
            storage.keys("app-temp-cache").await.unwrap(),
            vec![url("index.html"), url("main.js")]
        );
        assert!(fetcher.calls().iter().all(|r| r.cache == CacheMode::Reload));
        assert!(!storage.has_partition("app-cache").await.unwrap());
    }

    #[tokio::test]
    async fn install_fails_on_non_ok_core_resource() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        fetcher.set(&url("main.js"), Reply::Status(500, "oops".into()));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let err = sync.install().await.unwrap_err();

        assert!(matches!(err, Error::BadStatus { status: 500, .. }));
        assert_eq!(sync.state(), WorkerState::Redundant);
        assert!(storage.keys("app-temp-cache").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn install_failure_leaves_previous_content_untouched() {
        let storage = Arc::new(MemoryCacheStorage::new());
        installed_v1(&storage).await;
        let before = content_keys(&*storage).await;

        let fetcher = Arc::new(shell_fetcher("v2"));
        fetcher.set(&url("index.html"), Reply::Fail);
        let (sync, _) = make(v1(), &storage, &fetcher);

        assert!(sync.install().await.is_err());
        assert_eq!(content_keys(&*storage).await, before);
        assert!(matches!(
            sync.activate().await,
            Err(Error::InvalidTransition {
                from: WorkerState::Redundant,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn install_times_out_on_hung_core_fetch() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        fetcher.set(&url("main.js"), Reply::Hang);
        let (sync, _) = make(v1(), &storage, &fetcher);

        assert!(matches!(sync.install().await, Err(Error::Timeout { .. })));
        assert_eq!(sync.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn lifecycle_order_is_enforced() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);

        assert!(matches!(
            sync.activate().await,
            Err(Error::InvalidTransition {
                from: WorkerState::Uninstalled,
                to: WorkerState::Activating,
            })
        ));
        sync.install().await.unwrap();
        assert!(sync.install().await.is_err());
        sync.activate().await.unwrap();
        assert_eq!(sync.state(), WorkerState::Active);
        assert!(sync.activate().await.is_err());
    }

    // =========================================================================
    // Activate
    // =========================================================================

    #[tokio::test]
    async fn cold_start_promotes_temp_and_stores_manifest() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage
            .put("app-cache", &url("stale.js"), Response::new(200, "x"))
            .await
            .unwrap();
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, clients) = make(v1(), &storage, &fetcher);

        let outcome = cycle(&sync).await;

        let report = outcome.report().unwrap();
        assert_eq!(report.kind, ActivationKind::ColdStart);
        assert_eq!(report.promoted, 2);
        assert_eq!(
            content_keys(&*storage).await,
            vec![url("index.html"), url("main.js")]
        );
        assert!(!storage.has_partition("app-temp-cache").await.unwrap());
        let stored = storage
            .lookup("app-manifest", &format!("{ORIGIN}/manifest"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ResourceManifest::from_json(&stored.body).unwrap(),
            v1().resources
        );
        assert_eq!(clients.claims(), 1);
        assert_eq!(sync.state(), WorkerState::Active);
    }

    #[tokio::test]
    async fn upgrade_reuses_unchanged_resources() {
        let storage = Arc::new(MemoryCacheStorage::new());
        installed_v1(&storage).await;

        let v2 = bundle(
            &[
                ("/", "i1"),
                ("index.html", "i1"),
                ("main.js", "m1"),
                ("a.png", "a1"),
                ("b.png", "b1"),
                ("c.png", "c1"),
            ],
            &["index.html", "main.js"],
        );
        let fetcher = Arc::new(shell_fetcher("v2"));
        let (sync, _) = make(v2, &storage, &fetcher);

        let outcome = cycle(&sync).await;

        let report = outcome.report().unwrap();
        assert_eq!(report.kind, ActivationKind::Upgrade);
        assert_eq!(report.kept, 4);
        assert_eq!(report.evicted, 0);
        assert_eq!(body_of(&*storage, "app-cache", "a.png").await.unwrap(), "a.png v1");
        assert_eq!(body_of(&*storage, "app-cache", "b.png").await.unwrap(), "b.png v1");
        // Core entries are replaced by the freshly staged copies.
        assert_eq!(body_of(&*storage, "app-cache", "main.js").await.unwrap(), "main.js v2");
        assert!(body_of(&*storage, "app-cache", "c.png").await.is_none());
        assert_eq!(fetcher.call_count(&url("a.png")), 0);
    }

    #[tokio::test]
    async fn upgrade_adds_new_key_only_when_it_is_core() {
        let storage = Arc::new(MemoryCacheStorage::new());
        installed_v1(&storage).await;

        let v2 = bundle(
            &[
                ("/", "i1"),
                ("index.html", "i1"),
                ("main.js", "m1"),
                ("a.png", "a1"),
                ("b.png", "b1"),
                ("c.png", "c1"),
            ],
            &["index.html", "main.js", "c.png"],
        );
        let fetcher = Arc::new(shell_fetcher("v2"));
        let (sync, _) = make(v2, &storage, &fetcher);
        cycle(&sync).await;

        assert_eq!(body_of(&*storage, "app-cache", "c.png").await.unwrap(), "c.png v2");
    }

    #[tokio::test]
    async fn upgrade_evicts_changed_non_core_resource() {
        let storage = Arc::new(MemoryCacheStorage::new());
        installed_v1(&storage).await;

        let v2 = bundle(
            &[
                ("/", "i1"),
                ("index.html", "i1"),
                ("main.js", "m1"),
                ("a.png", "a2"),
                ("b.png", "b1"),
            ],
            &["index.html", "main.js"],
        );
        let fetcher = Arc::new(shell_fetcher("v2"));
        let (sync, _) = make(v2, &storage, &fetcher);

        let outcome = cycle(&sync).await;

        assert_eq!(outcome.report().unwrap().evicted, 1);
        assert!(body_of(&*storage, "app-cache", "a.png").await.is_none());
        assert!(body_of(&*storage, "app-cache", "b.png").await.is_some());
    }

    #[tokio::test]
    async fn upgrade_evicts_removed_resource() {
        let storage = Arc::new(MemoryCacheStorage::new());
        installed_v1(&storage).await;

        let v2 = bundle(
            &[("/", "i1"), ("index.html", "i1"), ("main.js", "m1"), ("a.png", "a1")],
            &["index.html", "main.js"],
        );
        let fetcher = Arc::new(shell_fetcher("v2"));
        let (sync, _) = make(v2, &storage, &fetcher);
        cycle(&sync).await;

        assert!(body_of(&*storage, "app-cache", "b.png").await.is_none());
        assert!(body_of(&*storage, "app-cache", "a.png").await.is_some());
    }

    #[tokio::test]
    async fn failed_activation_discards_everything_and_recovers_cold() {
        let storage = Arc::new(FailingStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (first, _) = make(v1(), &storage, &fetcher);
        cycle(&first).await;

        let (second, clients) = make(v1(), &storage, &fetcher);
        second.install().await.unwrap();
        storage.fail(StorageOp::Put, "app-cache");
        let outcome = second.activate().await.unwrap();

        assert!(outcome.is_reset());
        assert_eq!(second.state(), WorkerState::Active);
        assert_eq!(clients.claims(), 0);
        for partition in ["app-cache", "app-temp-cache", "app-manifest"] {
            assert!(!storage.has_partition(partition).await.unwrap(), "{partition}");
        }

        storage.heal();
        let (third, _) = make(v1(), &storage, &fetcher);
        let outcome = cycle(&third).await;
        assert_eq!(outcome.report().unwrap().kind, ActivationKind::ColdStart);
        assert_eq!(
            content_keys(&storage.inner).await,
            vec![url("index.html"), url("main.js")]
        );
        assert!(!storage.has_partition("app-temp-cache").await.unwrap());
    }

    #[tokio::test]
    async fn failure_reading_stored_manifest_resets() {
        let storage = Arc::new(FailingStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);
        sync.install().await.unwrap();
        storage.fail(StorageOp::Lookup, "app-manifest");

        assert!(sync.activate().await.unwrap().is_reset());
        assert!(!storage.has_partition("app-temp-cache").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_stored_manifest_resets() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage
            .put("app-manifest", &format!("{ORIGIN}/manifest"), Response::new(200, "{oops"))
            .await
            .unwrap();
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let outcome = cycle(&sync).await;

        assert!(matches!(
            outcome,
            ActivationOutcome::Reset {
                cause: Error::Json(_)
            }
        ));
        assert!(!storage.has_partition("app-manifest").await.unwrap());
    }

    // =========================================================================
    // Fetch interception
    // =========================================================================

    #[tokio::test]
    async fn cache_first_populates_lazily_on_ok_only() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        fetcher.set(&url("b.png"), Reply::Status(503, "busy".into()));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let first = sync.handle_fetch(&Request::get(url("a.png"))).await.unwrap().unwrap();
        let second = sync.handle_fetch(&Request::get(url("a.png"))).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.call_count(&url("a.png")), 1);

        let failed = sync.handle_fetch(&Request::get(url("b.png"))).await.unwrap().unwrap();
        assert_eq!(failed.status, 503);
        assert!(body_of(&*storage, "app-cache", "b.png").await.is_none());
    }

    #[tokio::test]
    async fn cache_first_propagates_network_error_on_miss() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        fetcher.set(&url("a.png"), Reply::Fail);
        let (sync, _) = make(v1(), &storage, &fetcher);

        assert!(matches!(
            sync.handle_fetch(&Request::get(url("a.png"))).await,
            Err(Error::Network { .. })
        ));
    }

    #[tokio::test]
    async fn request_variants_share_one_cache_entry() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage
            .put("app-cache", &url("/"), Response::new(200, "cached root"))
            .await
            .unwrap();
        storage
            .put("app-cache", &url("main.js"), Response::new(200, "cached main"))
            .await
            .unwrap();
        let fetcher = Arc::new(MockFetcher::new());
        for u in [ORIGIN.to_string(), format!("{ORIGIN}/"), format!("{ORIGIN}/#/settings")] {
            fetcher.set(&u, Reply::Fail);
        }
        let (sync, _) = make(v1(), &storage, &fetcher);

        for u in [ORIGIN.to_string(), format!("{ORIGIN}/#/settings")] {
            let r = sync.handle_fetch(&Request::get(u)).await.unwrap().unwrap();
            assert_eq!(r.body.as_ref(), b"cached root");
        }
        let r = sync
            .handle_fetch(&Request::get(format!("{ORIGIN}/main.js?v=123")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.body.as_ref(), b"cached main");
        assert_eq!(fetcher.call_count(&format!("{ORIGIN}/main.js?v=123")), 0);
    }

    #[tokio::test]
    async fn online_first_prefers_network_and_refreshes_cache() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage
            .put("app-cache", &url("/"), Response::new(200, "old root"))
            .await
            .unwrap();
        let fetcher = Arc::new(MockFetcher::new().with(&url("/"), Reply::ok("new root")));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let r = sync.handle_fetch(&Request::get(url("/"))).await.unwrap().unwrap();

        assert_eq!(r.body.as_ref(), b"new root");
        assert_eq!(body_of(&*storage, "app-cache", "/").await.unwrap(), "new root");
    }

    #[tokio::test]
    async fn online_first_stores_non_ok_root_responses() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage
            .put("app-cache", &url("/"), Response::new(200, "old"))
            .await
            .unwrap();
        let fetcher = Arc::new(
            MockFetcher::new().with(&url("/"), Reply::Status(500, "maintenance".into())),
        );
        let (sync, _) = make(v1(), &storage, &fetcher);

        let r = sync.handle_fetch(&Request::get(url("/"))).await.unwrap().unwrap();

        assert_eq!(r.status, 500);
        let cached = storage.lookup("app-cache", &url("/")).await.unwrap().unwrap();
        assert_eq!(cached.status, 500);
        assert_eq!(cached.body.as_ref(), b"maintenance");
    }

    #[tokio::test]
    async fn online_first_falls_back_to_cache_when_offline() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage
            .put("app-cache", &url("/"), Response::new(200, "cached root"))
            .await
            .unwrap();
        let fetcher = Arc::new(MockFetcher::new().with(&url("/"), Reply::Fail));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let r = sync.handle_fetch(&Request::get(url("/"))).await.unwrap().unwrap();
        assert_eq!(r.body.as_ref(), b"cached root");
    }

    #[tokio::test]
    async fn online_first_without_cache_propagates_network_error() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(MockFetcher::new().with(&url("/"), Reply::Fail));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let err = sync.handle_fetch(&Request::get(url("/"))).await.unwrap_err();
        assert!(matches!(err, Error::Network { url: ref u, .. } if u.ends_with('/')));
    }

    #[tokio::test]
    async fn non_manifest_and_non_get_requests_are_declined() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);

        let api = Request::get(format!("{ORIGIN}/api/items"));
        assert!(sync.handle_fetch(&api).await.unwrap().is_none());
        let foreign = Request::get("https://cdn.other.test/main.js");
        assert!(sync.handle_fetch(&foreign).await.unwrap().is_none());
        let post = Request::get(url("main.js")).with_method(Method::Post);
        assert!(sync.handle_fetch(&post).await.unwrap().is_none());

        assert!(fetcher.calls().is_empty());
        assert!(!storage.has_partition("app-cache").await.unwrap());
    }

    // =========================================================================
    // Messages and offline download
    // =========================================================================

    #[tokio::test]
    async fn download_offline_fills_missing_resources() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);
        cycle(&sync).await;

        let report = sync.download_offline(&NoProgress).await.unwrap();

        assert_eq!(report.already_cached, 2);
        assert_eq!(report.cached, 3);
        assert!(report.is_complete());
        assert_eq!(content_keys(&*storage).await.len(), 5);
        assert_eq!(fetcher.call_count(&url("index.html")), 1);
    }

    #[tokio::test]
    async fn missing_resources_lists_uncached_keys_in_order() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);
        cycle(&sync).await;

        let missing = sync.missing_resources().await.unwrap();
        let missing: Vec<_> = missing.iter().map(ResourceKey::as_str).collect();
        assert_eq!(missing, vec!["/", "a.png", "b.png"]);
    }

    #[tokio::test]
    async fn download_offline_reports_failures_and_keeps_going() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        fetcher.set(&url("a.png"), Reply::Status(404, "".into()));
        fetcher.set(&url("b.png"), Reply::Fail);
        let (sync, _) = make(v1(), &storage, &fetcher);

        let report = sync.download_offline(&NoProgress).await.unwrap();

        assert_eq!(report.cached, 3);
        let failed: Vec<_> = report.failed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(failed, vec!["a.png", "b.png"]);
        assert_eq!(
            content_keys(&*storage).await,
            vec![url("/"), url("index.html"), url("main.js")]
        );
    }

    #[tokio::test]
    async fn messages_route_to_controls() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, clients) = make(v1(), &storage, &fetcher);

        assert!(matches!(
            sync.handle_message("skipWaiting").await.unwrap(),
            MessageOutcome::SkippedWaiting
        ));
        assert_eq!(clients.skips(), 1);
        assert!(matches!(
            sync.handle_message("downloadOffline").await.unwrap(),
            MessageOutcome::DownloadedOffline(ref r) if r.cached == 5
        ));
        assert!(matches!(
            sync.handle_message("reload please").await.unwrap(),
            MessageOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn dispatch_drives_full_lifecycle() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(shell_fetcher("v1"));
        let (sync, _) = make(v1(), &storage, &fetcher);

        assert!(matches!(sync.dispatch(Event::Install).await.unwrap(), EventOutcome::Installed));
        assert!(matches!(
            sync.dispatch(Event::Activate).await.unwrap(),
            EventOutcome::Activated(ActivationOutcome::Activated(_))
        ));
        assert!(matches!(
            sync.dispatch(Event::Fetch(Request::get(url("main.js")))).await.unwrap(),
            EventOutcome::Responded(_)
        ));
        assert!(matches!(
            sync.dispatch(Event::Fetch(Request::get(format!("{ORIGIN}/api")))).await.unwrap(),
            EventOutcome::Declined
        ));
    }

    #[tokio::test]
    async fn concurrent_fetches_during_activation_settle() {
        let storage = Arc::new(MemoryCacheStorage::new());
        installed_v1(&storage).await;
        let fetcher = Arc::new(shell_fetcher("v2"));
        let (sync, _) = make(v1(), &storage, &fetcher);
        sync.install().await.unwrap();

        let requests: Vec<_> = ["a.png", "b.png", "main.js"]
            .iter()
            .map(|k| Request::get(url(k)))
            .collect();
        let (activated, served) = tokio::join!(
            sync.activate(),
            futures::future::join_all(requests.iter().map(|r| sync.handle_fetch(r)))
        );

        assert!(activated.unwrap().report().is_some());
        assert!(served.into_iter().all(|r| r.unwrap().is_some_and(|r| r.is_ok())));
    }

    #[test]
    fn resume_starts_active() {
        let sync = Synchronizer::resume(
            config(),
            v1(),
            MemoryCacheStorage::new(),
            MockFetcher::new(),
            NoClients,
        );
        assert_eq!(sync.state(), WorkerState::Active);
        assert!(!sync.id().is_empty());
    }
}
