//! Shared mock bridges and an engine harness for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result as BridgeResult},
    storage::{SettingsStore, StorageQuota, VolumeSpace},
    time::ManualClock,
    DownloadStream, HttpClient, HttpRequest, HttpResponse,
};
use bytes::Bytes;
use core_offline::{
    CacheKind, CacheLimit, CacheStore, CatalogEntry, ConnectionClass, Connectivity, DownloadQueue,
    Evictor, NetworkGate, OfflineConfig, OfflineManager, PolicyStore, ProtectedSet,
    SqliteCacheStore, StaticCatalog, TrackMeta, Variant,
};
use core_offline::{AudioBlob, BackgroundProfile};
use core_runtime::events::{CoreEvent, EventBus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::broadcast;

pub const MB: u64 = 1024 * 1024;

// ============================================================================
// Mock HTTP
// ============================================================================

#[derive(Clone)]
struct Route {
    body: Bytes,
    delay: Duration,
    failures_left: u32,
    stalls_left: u32,
    stall: Duration,
    announced_length: Option<u64>,
}

/// Serves registered URLs and records how many bodies are streamed at once.
#[derive(Default)]
pub struct MockHttpClient {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        let body = body.into();
        self.routes.lock().insert(
            url.to_string(),
            Route {
                announced_length: Some(body.len() as u64),
                body,
                delay: Duration::ZERO,
                failures_left: 0,
                stalls_left: 0,
                stall: Duration::ZERO,
            },
        );
    }

    /// Hold the first read of every response for `delay`.
    pub fn slow(&self, url: &str, delay: Duration) {
        if let Some(route) = self.routes.lock().get_mut(url) {
            route.delay = delay;
        }
    }

    /// Hold the first read of the next `times` responses for `stall`.
    pub fn stall(&self, url: &str, stall: Duration, times: u32) {
        if let Some(route) = self.routes.lock().get_mut(url) {
            route.stall = stall;
            route.stalls_left = times;
        }
    }

    /// Fail the next `times` requests with a network error.
    pub fn fail(&self, url: &str, times: u32) {
        if let Some(route) = self.routes.lock().get_mut(url) {
            route.failures_left = times;
        }
    }

    /// Announce more bytes than the body carries.
    pub fn truncate(&self, url: &str) {
        if let Some(route) = self.routes.lock().get_mut(url) {
            route.announced_length = Some(route.body.len() as u64 + 1024);
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.as_str() == url).count()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        Err(BridgeError::NotAvailable(format!("execute {}", request.url)))
    }

    async fn download_stream(&self, request: HttpRequest) -> BridgeResult<DownloadStream> {
        self.requests.lock().push(request.url.clone());

        let route = {
            let mut routes = self.routes.lock();
            let route = routes
                .get_mut(&request.url)
                .ok_or_else(|| BridgeError::HttpStatus {
                    status: 404,
                    url: request.url.clone(),
                })?;
            if route.failures_left > 0 {
                route.failures_left -= 1;
                return Err(BridgeError::Network(format!("connection reset: {}", request.url)));
            }
            let mut served = route.clone();
            if route.stalls_left > 0 {
                route.stalls_left -= 1;
                served.delay = route.stall;
            }
            served
        };

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let reader = TrackedReader {
            inner: io::Cursor::new(route.body),
            delay: (!route.delay.is_zero()).then(|| Box::pin(tokio::time::sleep(route.delay))),
            _guard: ActiveGuard(self.active.clone()),
        };
        Ok(DownloadStream::new(route.announced_length, Box::new(reader)))
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackedReader {
    inner: io::Cursor<Bytes>,
    delay: Option<Pin<Box<tokio::time::Sleep>>>,
    _guard: ActiveGuard,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(delay) = this.delay.as_mut() {
            std::task::ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

// ============================================================================
// Mock Settings and Quota
// ============================================================================

#[derive(Default)]
pub struct MockSettingsStore {
    data: Mutex<HashMap<String, String>>,
}

impl MockSettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MockSettingsStore {
    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.data.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set_bool(&self, key: &str, value: bool) -> BridgeResult<()> {
        self.set_string(key, &value.to_string()).await
    }

    async fn get_bool(&self, key: &str) -> BridgeResult<Option<bool>> {
        Ok(self.data.lock().get(key).and_then(|v| v.parse().ok()))
    }

    async fn set_i64(&self, key: &str, value: i64) -> BridgeResult<()> {
        self.set_string(key, &value.to_string()).await
    }

    async fn get_i64(&self, key: &str) -> BridgeResult<Option<i64>> {
        Ok(self.data.lock().get(key).and_then(|v| v.parse().ok()))
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> BridgeResult<Vec<String>> {
        Ok(self.data.lock().keys().cloned().collect())
    }

    async fn clear_all(&self) -> BridgeResult<()> {
        self.data.lock().clear();
        Ok(())
    }
}

/// Volume with adjustable free space. `None` makes the query fail.
pub struct MockStorageQuota {
    available: Mutex<Option<u64>>,
}

impl MockStorageQuota {
    pub fn new(available_bytes: u64) -> Self {
        Self {
            available: Mutex::new(Some(available_bytes)),
        }
    }

    pub fn set_available(&self, bytes: Option<u64>) {
        *self.available.lock() = bytes;
    }
}

#[async_trait]
impl StorageQuota for MockStorageQuota {
    async fn volume_space(&self) -> BridgeResult<VolumeSpace> {
        match *self.available.lock() {
            Some(available) => Ok(VolumeSpace::new(64 * 1024 * MB, available)),
            None => Err(BridgeError::OperationFailed("statvfs failed".to_string())),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn url(uid: &str, variant: Variant) -> String {
    format!("https://cdn.test/{}/{}", uid, variant)
}

pub fn test_config() -> OfflineConfig {
    OfflineConfig::default()
        .with_background_profile(BackgroundProfile::Aggressive)
        .with_retry(2, Duration::from_millis(20), Duration::from_millis(100))
        .with_stall_timeout(Duration::from_secs(2))
}

/// Every engine component wired against mocks, with the queue not yet
/// started.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub http: Arc<MockHttpClient>,
    pub settings: Arc<MockSettingsStore>,
    pub quota: Arc<MockStorageQuota>,
    pub store: Arc<SqliteCacheStore>,
    pub catalog: Arc<StaticCatalog>,
    pub connectivity: Connectivity,
    pub policy: Arc<PolicyStore>,
    pub protected: ProtectedSet,
    pub evictor: Arc<Evictor>,
    pub queue: DownloadQueue,
    pub manager: Arc<OfflineManager>,
    pub bus: EventBus,
    pub config: OfflineConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: OfflineConfig) -> Self {
        Self::build(config, Arc::new(MockSettingsStore::new())).await
    }

    /// A fresh engine over settings persisted by an earlier one.
    pub async fn with_settings(settings: Arc<MockSettingsStore>) -> Self {
        Self::build(test_config(), settings).await
    }

    async fn build(config: OfflineConfig, settings: Arc<MockSettingsStore>) -> Self {
        let clock = Arc::new(ManualClock::default());
        let http = Arc::new(MockHttpClient::new());
        let quota = Arc::new(MockStorageQuota::new(10 * 1024 * MB));
        let bus = EventBus::new(1024);

        let store = Arc::new(SqliteCacheStore::in_memory(clock.clone()).await.unwrap());
        let store_dyn: Arc<dyn CacheStore> = store.clone();
        let catalog = Arc::new(StaticCatalog::new());
        let connectivity = Connectivity::new(ConnectionClass::Wifi);

        let policy = Arc::new(
            PolicyStore::new(settings.clone(), quota.clone(), config.min_free_space_bytes)
                .with_event_bus(bus.clone()),
        );
        policy.load().await.unwrap();

        let protected = ProtectedSet::new();
        let evictor = Arc::new(
            Evictor::new(
                store_dyn.clone(),
                policy.clone(),
                quota.clone(),
                protected.clone(),
                &config,
            )
            .with_event_bus(bus.clone()),
        );

        let queue = DownloadQueue::builder(http.clone(), store_dyn.clone(), clock.clone())
            .gate(Arc::new(NetworkGate::new(policy.clone(), connectivity.clone())))
            .capacity_guard(evictor.clone())
            .event_bus(bus.clone())
            .config(config.clone())
            .build();

        let manager = Arc::new(
            OfflineManager::new(
                store_dyn,
                policy.clone(),
                queue.clone(),
                catalog.clone(),
                settings.clone(),
                clock.clone(),
                evictor.clone(),
                config.clone(),
            )
            .with_event_bus(bus.clone()),
        );
        manager.load().await.unwrap();

        Self {
            clock,
            http,
            settings,
            quota,
            store,
            catalog,
            connectivity,
            policy,
            protected,
            evictor,
            queue,
            manager,
            bus,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }

    /// Register a track with both variants in the catalog and on the server.
    pub fn add_track(&self, uid: &str, hi_bytes: usize, lo_bytes: usize) {
        let hi = url(uid, Variant::Hi);
        let lo = url(uid, Variant::Lo);
        self.http.serve(&hi, vec![0xA5u8; hi_bytes]);
        self.http.serve(&lo, vec![0x5Au8; lo_bytes]);
        self.catalog.insert(
            CatalogEntry::new(uid)
                .with_hi(hi, Some(hi_bytes as u64))
                .with_lo(lo, Some(lo_bytes as u64)),
        );
    }

    /// Put a complete local copy straight into the store.
    pub async fn seed(&self, uid: &str, variant: Variant, size: usize, kind: CacheKind) -> TrackMeta {
        let blob = AudioBlob::new(uid, variant, Bytes::from(vec![7u8; size]), self.clock_secs());
        let mut meta = TrackMeta::new(uid);
        meta.cache_kind = kind;
        meta.pinned = kind == CacheKind::Pinned;
        meta.cached_variant = Some(variant);
        meta.cached_complete = 100;
        meta.stored_size_bytes = Some(size as u64);
        self.store.put_blob_with_meta(&blob, &meta).await.unwrap();
        meta
    }

    pub async fn set_cache_limit_mb(&self, mb: u64) {
        self.policy.set_cache_limit(CacheLimit::Megabytes(mb)).await.unwrap();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.bus.subscribe()
    }

    fn clock_secs(&self) -> i64 {
        use bridge_traits::time::Clock;
        self.clock.unix_timestamp()
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain every event received so far.
pub fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
