//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, settings,
//! storage quota, network monitor) into the offline cache engine and exposes
//! the surface the UI and the player talk to. Desktop apps typically enable
//! the `desktop-shims` feature, which lets [`EngineConfig`] fill in defaults
//! from `bridge-desktop`.
//!
//! ```ignore
//! use core_offline::{OfflineConfig, StaticCatalog};
//! use core_runtime::config::EngineConfig;
//! use core_service::OfflineCacheService;
//! use std::sync::Arc;
//!
//! let engine = EngineConfig::builder().build().await?;
//! core_runtime::logging::init_logging(engine.logging_config())?;
//!
//! let service = OfflineCacheService::bootstrap(
//!     engine,
//!     OfflineConfig::default(),
//!     Arc::new(StaticCatalog::new()),
//! )
//! .await?;
//! service.start()?;
//!
//! let source = service.resolve_playback("track-1").await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::NetworkMonitor;
use bytes::Bytes;
use core_offline::{
    connectivity, CacheBreakdown, CacheLimit, CacheStore, ClearSummary, CloudThresholds,
    Connectivity, Direction, Evictor, FullListenSignal, MaintenanceReport, Mode, NetworkGate,
    NetworkPolicy, OfflineConfig, OfflineManager, Policy, PolicyStore, ProtectedSet,
    QueueStatus, QuotaEstimate, ResolvedSource, SqliteCacheStore, StatsCore, TaskInfo,
    TrackCatalog, TrackOfflineState, TrackResolver, Variant, WindowSlots,
};
use core_offline::{DownloadQueue, PlaybackWindow};
use core_runtime::config::EngineConfig;
use core_runtime::events::{CoreEvent, EventBus};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Primary façade exposed to host applications.
///
/// Owns every engine component. Background work starts with
/// [`start`](Self::start) and stops with [`shutdown`](Self::shutdown).
pub struct OfflineCacheService {
    events: EventBus,
    store: Arc<dyn CacheStore>,
    policy: Arc<PolicyStore>,
    connectivity: Connectivity,
    queue: DownloadQueue,
    evictor: Arc<Evictor>,
    manager: Arc<OfflineManager>,
    resolver: TrackResolver,
    window: PlaybackWindow,
    stats: Arc<StatsCore>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    promotions: Mutex<Option<mpsc::UnboundedReceiver<FullListenSignal>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineCacheService {
    /// Open the cache database and wire every component.
    ///
    /// Persisted policy, cloud thresholds and the offline selection are
    /// restored here. Nothing runs in the background until
    /// [`start`](Self::start).
    #[instrument(skip_all, fields(database = %engine.database_path.display()))]
    pub async fn bootstrap(
        engine: EngineConfig,
        offline: OfflineConfig,
        catalog: Arc<dyn TrackCatalog>,
    ) -> Result<Self> {
        offline.validate()?;

        let events = EventBus::new(engine.event_buffer_size);
        let shutdown = CancellationToken::new();

        let mut store = SqliteCacheStore::open(&engine.database_path, engine.clock.clone())
            .await?
            .with_volume(engine.storage_quota.clone());
        if let Some(bytes) = offline.store_capacity_bytes {
            store = store.with_capacity(bytes);
        }
        let store: Arc<dyn CacheStore> = Arc::new(store);

        let policy = Arc::new(
            PolicyStore::new(
                engine.settings_store.clone(),
                engine.storage_quota.clone(),
                offline.min_free_space_bytes,
            )
            .with_event_bus(events.clone()),
        );
        policy.load().await?;

        let connectivity = Connectivity::default();
        let protected = ProtectedSet::new();

        let evictor = Arc::new(
            Evictor::new(
                store.clone(),
                policy.clone(),
                engine.storage_quota.clone(),
                protected.clone(),
                &offline,
            )
            .with_event_bus(events.clone()),
        );

        let queue = DownloadQueue::builder(
            engine.http_client.clone(),
            store.clone(),
            engine.clock.clone(),
        )
        .gate(Arc::new(NetworkGate::new(policy.clone(), connectivity.clone())))
        .capacity_guard(evictor.clone())
        .event_bus(events.clone())
        .config(offline.clone())
        .platform(engine.platform)
        .shutdown_token(shutdown.child_token())
        .build();

        let manager = Arc::new(
            OfflineManager::new(
                store.clone(),
                policy.clone(),
                queue.clone(),
                catalog.clone(),
                engine.settings_store.clone(),
                engine.clock.clone(),
                evictor.clone(),
                offline,
            )
            .with_event_bus(events.clone()),
        );
        manager.load().await?;

        let resolver = TrackResolver::new(
            store.clone(),
            policy.clone(),
            catalog.clone(),
            connectivity.clone(),
        );
        let window = PlaybackWindow::new(
            queue.clone(),
            store.clone(),
            policy.clone(),
            catalog,
            connectivity.clone(),
            protected,
        );

        let (stats, promotions) = StatsCore::new(store.clone());
        let stats = Arc::new(stats.with_event_bus(events.clone()));

        info!(
            platform = ?engine.platform,
            mode = %policy.mode(),
            network_monitor = engine.network_monitor.is_some(),
            "Offline cache service ready"
        );

        Ok(Self {
            events,
            store,
            policy,
            connectivity,
            queue,
            evictor,
            manager,
            resolver,
            window,
            stats,
            network_monitor: engine.network_monitor,
            promotions: Mutex::new(Some(promotions)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the queue dispatcher, the stats ticker, the promotion listener,
    /// periodic maintenance and the connectivity watcher.
    ///
    /// Must be called from within a Tokio runtime. Fails when called twice.
    pub fn start(&self) -> Result<()> {
        let Some(promotions) = self.promotions.lock().take() else {
            return Err(CoreError::InitializationFailed(
                "Service already started".to_string(),
            ));
        };

        let mut tasks = self.tasks.lock();
        tasks.push(self.queue.start());
        tasks.push(self.stats.clone().spawn_ticker(self.shutdown.child_token()));
        tasks.push(
            self.manager
                .clone()
                .spawn_promotion_listener(promotions, self.shutdown.child_token()),
        );
        tasks.push(self.manager.clone().spawn_maintenance(self.shutdown.child_token()));

        match &self.network_monitor {
            Some(monitor) => {
                let queue = self.queue.clone();
                tasks.push(connectivity::spawn_watcher(
                    monitor.clone(),
                    self.connectivity.clone(),
                    move |class| {
                        debug!(connection = class.as_str(), "Connection class changed");
                        queue.notify_conditions_changed();
                    },
                    self.shutdown.child_token(),
                ));
            }
            None => warn!("No network monitor, connection class stays unknown"),
        }

        info!(tasks = tasks.len(), "Offline cache service started");
        Ok(())
    }

    /// Cancel every background task and wait for them to finish.
    /// Interrupted downloads stay queued in memory and are not persisted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Offline cache service stopped");
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Receive every engine event from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    // ========================================================================
    // Playback
    // ========================================================================

    /// Pick the source the player should open for `uid`.
    pub async fn resolve_playback(&self, uid: &str) -> Result<ResolvedSource> {
        Ok(self.resolver.resolve(uid).await?)
    }

    /// The player moved to `playlist[index]`. Starts a new play-through and
    /// refreshes the playback window.
    #[instrument(skip(self, playlist), fields(len = playlist.len()))]
    pub async fn on_track_started(
        &self,
        playlist: &[String],
        index: usize,
        direction: Direction,
        duration: Duration,
    ) -> Result<Option<WindowSlots>> {
        if let Some(uid) = playlist.get(index) {
            self.stats.on_track_start(uid, duration);
        }
        Ok(self.window.on_track_change(playlist, index, direction).await?)
    }

    pub fn on_pause(&self) {
        self.stats.on_pause();
    }

    pub fn on_resume(&self) {
        self.stats.on_resume();
    }

    pub async fn on_seek(&self, position: Duration) -> Result<()> {
        Ok(self.stats.on_seek(position).await?)
    }

    pub async fn on_track_ended(&self) -> Result<()> {
        Ok(self.stats.on_end().await?)
    }

    pub async fn on_skip(&self, position: Duration) -> Result<()> {
        Ok(self.stats.on_skip(position).await?)
    }

    /// Playback stopped at `position`; the window no longer protects anything.
    pub async fn on_stop(&self, position: Duration) -> Result<()> {
        self.window.on_stop();
        Ok(self.stats.on_skip(position).await?)
    }

    // ========================================================================
    // Policy
    // ========================================================================

    pub fn policy(&self) -> Policy {
        self.policy.snapshot()
    }

    /// Switch modes. R3 is only entered once every selected track is
    /// downloaded; otherwise this fails with `OfflineSelectionIncomplete`.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        match mode {
            Mode::R3 => self.manager.activate_full_offline().await?,
            _ => self.policy.set_mode(mode).await?,
        }
        self.queue.notify_conditions_changed();
        Ok(())
    }

    /// Leave R2 for the mode that was active before it.
    pub async fn disable_dynamic_offline(&self) -> Result<Mode> {
        let mode = self.policy.disable_dynamic_offline().await?;
        self.queue.notify_conditions_changed();
        Ok(mode)
    }

    pub async fn set_playback_quality(&self, quality: Variant) -> Result<()> {
        Ok(self.policy.set_playback_quality(quality).await?)
    }

    pub async fn set_cache_quality(&self, quality: Variant) -> Result<()> {
        Ok(self.policy.set_cache_quality(quality).await?)
    }

    pub async fn set_full_offline_quality(&self, quality: Variant) -> Result<()> {
        Ok(self.policy.set_full_offline_quality(quality).await?)
    }

    pub async fn set_network_policy(&self, network_policy: NetworkPolicy) -> Result<()> {
        self.policy.set_network_policy(network_policy).await?;
        self.queue.notify_conditions_changed();
        Ok(())
    }

    /// Change the cache budget and evict down to it right away.
    /// Returns the bytes freed.
    pub async fn set_cache_limit(&self, limit: CacheLimit) -> Result<u64> {
        self.policy.set_cache_limit(limit).await?;
        Ok(self.evictor.enforce_budget().await?)
    }

    pub fn cloud_thresholds(&self) -> CloudThresholds {
        self.manager.cloud_thresholds()
    }

    pub async fn set_cloud_thresholds(&self, listen_threshold: u32, ttl_days: u32) -> Result<()> {
        Ok(self
            .manager
            .set_cloud_thresholds(listen_threshold, ttl_days)
            .await?)
    }

    // ========================================================================
    // Offline State
    // ========================================================================

    pub async fn get_track_offline_state(&self, uid: &str) -> Result<TrackOfflineState> {
        Ok(self.manager.get_track_offline_state(uid).await?)
    }

    pub async fn pin(&self, uid: &str) -> Result<()> {
        Ok(self.manager.pin(uid).await?)
    }

    pub async fn unpin(&self, uid: &str) -> Result<()> {
        Ok(self.manager.unpin(uid).await?)
    }

    pub async fn get_breakdown(&self) -> Result<CacheBreakdown> {
        Ok(self.manager.get_breakdown().await?)
    }

    pub async fn estimate_quota(&self) -> Result<QuotaEstimate> {
        Ok(self.store.estimate_quota().await?)
    }

    pub async fn clear_all_cache(&self) -> Result<ClearSummary> {
        Ok(self.manager.clear_all_cache().await?)
    }

    /// Queue an artwork or other non-audio asset. Returns whether a download
    /// was queued; `false` means it is already stored.
    pub async fn prefetch_asset(&self, key: &str) -> Result<bool> {
        Ok(self.manager.prefetch_asset(key).await?)
    }

    pub async fn get_asset(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.manager.get_asset(key).await?)
    }

    /// Run every maintenance job once, outside the periodic schedule.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.manager.run_maintenance().await
    }

    // ========================================================================
    // Full Offline
    // ========================================================================

    pub fn offline_selection(&self) -> Vec<String> {
        self.manager.offline_selection()
    }

    pub async fn set_offline_selection(&self, uids: Vec<String>) -> Result<()> {
        Ok(self.manager.set_offline_selection(uids).await?)
    }

    /// Queue downloads for every selected track. Returns the number queued.
    pub async fn download_offline_selection(&self) -> Result<usize> {
        Ok(self.manager.download_offline_selection().await?)
    }

    pub async fn activate_full_offline(&self) -> Result<()> {
        self.set_mode(Mode::R3).await
    }

    // ========================================================================
    // Queue
    // ========================================================================

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn queue_snapshot(&self) -> Vec<TaskInfo> {
        self.queue.snapshot()
    }

    /// Drop queued and running downloads of `uid`. Returns how many were
    /// removed.
    pub fn cancel_downloads(&self, uid: &str) -> usize {
        self.queue.cancel(uid)
    }
}
