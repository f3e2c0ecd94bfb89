//! # Offline Manager
//!
//! Owns the pinned and cloud lifecycle of cached tracks and issues the
//! matching work to the download queue.
//!
//! ## Responsibilities
//!
//! - **Pinning**: a pinned track is downloaded at the cache quality and is
//!   never evicted. Unpinning keeps the copy as a cloud candidate with a
//!   fresh TTL.
//! - **Cloud promotion**: tracks fully listened to often enough become cloud
//!   copies that expire a fixed number of days after promotion. Listening to
//!   a valid cloud copy again does not extend it.
//! - **Maintenance**: expired cloud copies are swept, copies whose remote
//!   size changed are flagged and refreshed, degraded copies are re-cached,
//!   and the cache is held to its budget.
//! - **Full offline**: a user-selected set is downloaded in bulk, and the
//!   engine only enters R3 once every selected track is complete.
//!
//! Only this manager writes the `pinned`, `cloud` and `selected_for_offline`
//! flags, always through [`CacheStore::patch_meta`] so that download results
//! and listen counters written concurrently are kept.

mod eviction;

pub use eviction::Evictor;

use bridge_traits::storage::SettingsStore;
use bridge_traits::time::Clock;
use bytes::Bytes;
use core_runtime::events::{CoreEvent, EventBus, OfflineEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::TrackCatalog;
use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};
use crate::model::{CacheBreakdown, CacheKind, TrackMeta, TrackOfflineState, Variant};
use crate::policy::{Mode, PolicyStore};
use crate::queue::{DownloadQueue, DownloadTask, Priority};
use crate::stats::FullListenSignal;
use crate::store::{CacheStore, ClearSummary, MetaPatch};

pub const CLOUD_THRESHOLD_KEY: &str = "offline.cloud.threshold";
pub const CLOUD_TTL_DAYS_KEY: &str = "offline.cloud.ttl_days";
pub const OFFLINE_SELECTION_KEY: &str = "offline.selection";

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Promotion rule for cloud copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudThresholds {
    /// Full listens needed to become a cloud copy.
    pub listen_threshold: u32,
    /// Days a cloud copy lives without being promoted again.
    pub ttl_days: u32,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: Vec<String>,
    pub stale: Vec<String>,
    pub re_cached: usize,
    pub evicted_bytes: u64,
}

pub struct OfflineManager {
    store: Arc<dyn CacheStore>,
    policy: Arc<PolicyStore>,
    queue: DownloadQueue,
    catalog: Arc<dyn TrackCatalog>,
    settings: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    evictor: Arc<Evictor>,
    thresholds: RwLock<CloudThresholds>,
    selection: RwLock<Vec<String>>,
    config: OfflineConfig,
    event_bus: Option<EventBus>,
}

impl OfflineManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CacheStore>,
        policy: Arc<PolicyStore>,
        queue: DownloadQueue,
        catalog: Arc<dyn TrackCatalog>,
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
        evictor: Arc<Evictor>,
        config: OfflineConfig,
    ) -> Self {
        let thresholds = CloudThresholds {
            listen_threshold: config.cloud_listen_threshold,
            ttl_days: config.cloud_ttl_days,
        };
        Self {
            store,
            policy,
            queue,
            catalog,
            settings,
            clock,
            evictor,
            thresholds: RwLock::new(thresholds),
            selection: RwLock::new(Vec::new()),
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.evictor
    }

    /// Restore persisted thresholds and the offline selection.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<()> {
        let mut thresholds = *self.thresholds.read();
        if let Some(value) = self.settings.get_i64(CLOUD_THRESHOLD_KEY).await? {
            thresholds.listen_threshold = u32::try_from(value).unwrap_or(thresholds.listen_threshold);
        }
        if let Some(value) = self.settings.get_i64(CLOUD_TTL_DAYS_KEY).await? {
            thresholds.ttl_days = u32::try_from(value).unwrap_or(thresholds.ttl_days);
        }
        *self.thresholds.write() = thresholds;

        let selection = match self.settings.get_string(OFFLINE_SELECTION_KEY).await? {
            Some(json) => serde_json::from_str::<Vec<String>>(&json).unwrap_or_else(|e| {
                warn!(error = %e, "Stored offline selection is unreadable, starting empty");
                Vec::new()
            }),
            None => Vec::new(),
        };
        *self.selection.write() = selection;

        info!(
            listen_threshold = thresholds.listen_threshold,
            ttl_days = thresholds.ttl_days,
            selected = self.selection.read().len(),
            "Offline manager loaded"
        );
        Ok(())
    }

    pub fn cloud_thresholds(&self) -> CloudThresholds {
        *self.thresholds.read()
    }

    pub async fn set_cloud_thresholds(&self, listen_threshold: u32, ttl_days: u32) -> Result<()> {
        if listen_threshold == 0 || ttl_days == 0 {
            return Err(OfflineError::Config(
                "Cloud listen threshold and TTL must be at least 1".to_string(),
            ));
        }
        self.settings
            .set_i64(CLOUD_THRESHOLD_KEY, i64::from(listen_threshold))
            .await?;
        self.settings.set_i64(CLOUD_TTL_DAYS_KEY, i64::from(ttl_days)).await?;
        *self.thresholds.write() = CloudThresholds {
            listen_threshold,
            ttl_days,
        };
        Ok(())
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    /// Keep `uid` offline at the cache quality.
    #[instrument(skip(self))]
    pub async fn pin(&self, uid: &str) -> Result<()> {
        let quality = self.policy.cache_quality();
        let current = self.meta_or_new(uid).await?;

        let needs_download = !current.is_complete_at(quality);
        let url = if needs_download {
            Some(self.remote_url(uid, quality).await?)
        } else {
            None
        };

        let meta = self
            .store
            .patch_meta(uid, &MetaPatch::new().pinned(true).cache_kind(CacheKind::Pinned))
            .await?;
        self.emit_state(&meta);
        info!(uid, quality = %quality, needs_download, "Track pinned");

        if let Some(url) = url {
            self.queue.enqueue(DownloadTask::audio(
                uid,
                quality,
                url,
                Priority::P2,
                CacheKind::Pinned,
            ));
        }
        Ok(())
    }

    /// Release the pin. The copy stays as a cloud candidate with a fresh TTL.
    #[instrument(skip(self))]
    pub async fn unpin(&self, uid: &str) -> Result<()> {
        let pinned = self
            .store
            .get_meta(uid)
            .await?
            .is_some_and(|meta| meta.pinned);
        if !pinned {
            return Ok(());
        }

        let now = self.clock.unix_timestamp();
        let patch = MetaPatch::new()
            .pinned(false)
            .cloud(true)
            .cache_kind(CacheKind::Cloud)
            .cloud_window(now, self.expiry_from(now));
        let meta = self.store.patch_meta(uid, &patch).await?;
        self.emit_state(&meta);
        info!(uid, "Track unpinned");
        Ok(())
    }

    // ========================================================================
    // Cloud Lifecycle
    // ========================================================================

    /// Promote a track once its cloud-facing listen count reaches the
    /// threshold. Returns whether it was promoted.
    #[instrument(skip(self), fields(uid = %signal.uid))]
    pub async fn on_full_listen(&self, signal: &FullListenSignal) -> Result<bool> {
        let thresholds = self.cloud_thresholds();
        if signal.cloud_full_listen_count < thresholds.listen_threshold {
            return Ok(false);
        }

        let now = self.clock.unix_timestamp();
        let current = self.meta_or_new(&signal.uid).await?;
        if current.pinned || current.is_cloud_valid(now) {
            return Ok(false);
        }

        let expires_at = self.expiry_from(now);
        let mut patch = MetaPatch::new().cloud(true).cloud_window(now, expires_at);
        if current.cache_kind.retention_rank() < CacheKind::Cloud.retention_rank() {
            patch = patch.cache_kind(CacheKind::Cloud);
        }
        let meta = self.store.patch_meta(&signal.uid, &patch).await?;

        info!(
            uid = %signal.uid,
            full_listen_count = signal.cloud_full_listen_count,
            expires_at,
            "Track promoted to cloud"
        );
        self.emit(OfflineEvent::CloudPromoted {
            uid: signal.uid.clone(),
            full_listen_count: signal.cloud_full_listen_count,
            expires_at,
        });
        self.emit_state(&meta);

        if !meta.is_complete() {
            let quality = self.policy.cache_quality();
            match self.remote_url(&signal.uid, quality).await {
                Ok(url) => {
                    self.queue.enqueue(DownloadTask::audio(
                        signal.uid.clone(),
                        quality,
                        url,
                        Priority::P4,
                        CacheKind::Cloud,
                    ));
                }
                Err(e) => warn!(uid = %signal.uid, error = %e, "Cloud copy cannot be fetched"),
            }
        }
        Ok(true)
    }

    /// Feed promotion signals from the stats core until `shutdown` fires.
    pub fn spawn_promotion_listener(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<FullListenSignal>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => {
                        let Some(signal) = signal else { break };
                        if let Err(e) = self.on_full_listen(&signal).await {
                            warn!(uid = %signal.uid, error = %e, "Cloud promotion failed");
                        }
                    }
                }
            }
            debug!("Promotion listener stopped");
        })
    }

    /// Delete expired, unpinned cloud copies and reset their cloud stats.
    /// Returns the uids removed.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let now = self.clock.unix_timestamp();
        let mut expired = Vec::new();

        for meta in self.store.get_all_meta().await? {
            if !meta.is_cloud_expired(now) || meta.selected_for_offline {
                continue;
            }

            self.queue.cancel(&meta.uid);
            let freed_bytes = self.store.delete_track(&meta.uid).await?;
            self.store.reset_cloud_stats(&meta.uid).await?;

            debug!(uid = %meta.uid, freed_bytes, "Cloud copy expired");
            self.emit(OfflineEvent::CloudExpired {
                uid: meta.uid.clone(),
                freed_bytes,
            });
            expired.push(meta.uid);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired cloud copies removed");
        }
        Ok(expired)
    }

    // ========================================================================
    // Freshness
    // ========================================================================

    /// Flag local copies whose size no longer matches the catalog and queue
    /// a refresh. The existing copy stays playable. Returns the flagged uids.
    #[instrument(skip(self))]
    pub async fn check_staleness(&self) -> Result<Vec<String>> {
        let tolerance = self.config.staleness_tolerance_bytes;
        let mut flagged = Vec::new();

        for meta in self.store.get_all_meta().await? {
            let (Some(variant), Some(stored)) = (meta.cached_variant, meta.stored_size_bytes) else {
                continue;
            };
            let Some(entry) = self.catalog.entry(&meta.uid).await? else {
                continue;
            };
            let Some(declared) = entry.declared_size(variant) else {
                continue;
            };

            if declared.abs_diff(stored) <= tolerance {
                continue;
            }

            let mismatch = OfflineError::IntegrityMismatch {
                uid: meta.uid.clone(),
                declared_bytes: declared,
                stored_bytes: stored,
            };
            warn!(error = %mismatch, "Cached copy is stale");

            if !meta.needs_update {
                let flagged_meta = self
                    .store
                    .patch_meta(&meta.uid, &MetaPatch::new().needs_update(true))
                    .await?;
                self.emit(OfflineEvent::NeedsUpdate {
                    uid: meta.uid.clone(),
                    declared_bytes: declared,
                    stored_bytes: stored,
                });
                self.emit_state(&flagged_meta);
            }

            if let Some(url) = entry.url_for(variant) {
                self.queue.enqueue(DownloadTask::audio(
                    meta.uid.clone(),
                    variant,
                    url,
                    Priority::P3,
                    refresh_kind(&meta),
                ));
            }
            flagged.push(meta.uid);
        }
        Ok(flagged)
    }

    /// Queue proper downloads for copies the resolver played at the wrong
    /// quality. Returns the number of tasks queued.
    #[instrument(skip(self))]
    pub async fn process_re_cache(&self) -> Result<usize> {
        let mut queued = 0;

        for meta in self.store.get_all_meta().await? {
            if !meta.needs_re_cache {
                continue;
            }
            let quality = if meta.pinned || meta.cloud {
                self.policy.cache_quality()
            } else {
                self.policy.active_playback_quality()
            };
            if meta.is_complete_at(quality) {
                continue;
            }

            match self.remote_url(&meta.uid, quality).await {
                Ok(url) => {
                    self.queue.enqueue(DownloadTask::audio(
                        meta.uid.clone(),
                        quality,
                        url,
                        Priority::P3,
                        refresh_kind(&meta),
                    ));
                    queued += 1;
                }
                Err(e) => debug!(uid = %meta.uid, error = %e, "Re-cache skipped"),
            }
        }
        Ok(queued)
    }

    // ========================================================================
    // Full Offline
    // ========================================================================

    pub fn offline_selection(&self) -> Vec<String> {
        self.selection.read().clone()
    }

    /// Replace the set of tracks that must be available in R3.
    #[instrument(skip(self, uids), fields(count = uids.len()))]
    pub async fn set_offline_selection(&self, uids: Vec<String>) -> Result<()> {
        let mut seen = HashSet::new();
        let selection: Vec<String> = uids.into_iter().filter(|uid| seen.insert(uid.clone())).collect();

        let json = serde_json::to_string(&selection)?;
        self.settings.set_string(OFFLINE_SELECTION_KEY, &json).await?;

        for meta in self.store.get_all_meta().await? {
            if meta.selected_for_offline && !seen.contains(&meta.uid) {
                self.store
                    .patch_meta(&meta.uid, &MetaPatch::new().selected_for_offline(false))
                    .await?;
            }
        }
        *self.selection.write() = selection;
        self.apply_selection_flags().await?;

        info!(count = seen.len(), "Offline selection updated");
        Ok(())
    }

    /// Queue bulk downloads for every selected track that is not complete at
    /// the full-offline quality. Returns the number of tasks queued.
    #[instrument(skip(self))]
    pub async fn download_offline_selection(&self) -> Result<usize> {
        let quality = self.policy.full_offline_quality();
        let mut queued = 0;

        for uid in self.offline_selection() {
            if let Some(meta) = self.store.get_meta(&uid).await? {
                if meta.is_complete_at(quality) {
                    continue;
                }
            }
            match self.remote_url(&uid, quality).await {
                Ok(url) => {
                    self.queue.enqueue(DownloadTask::audio(
                        uid,
                        quality,
                        url,
                        Priority::P6,
                        CacheKind::Cloud,
                    ));
                    queued += 1;
                }
                Err(e) => warn!(uid = %uid, error = %e, "Selected track cannot be fetched"),
            }
        }

        info!(queued, quality = %quality, "Full-offline download scheduled");
        Ok(queued)
    }

    /// Selected tracks without a complete local copy.
    pub async fn missing_offline_tracks(&self) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for uid in self.offline_selection() {
            let complete = self
                .store
                .get_meta(&uid)
                .await?
                .is_some_and(|meta| meta.is_complete());
            if !complete {
                missing.push(uid);
            }
        }
        Ok(missing)
    }

    /// Enter R3. Refused while any selected track is incomplete; the mode is
    /// left as it was.
    #[instrument(skip(self))]
    pub async fn activate_full_offline(&self) -> Result<()> {
        let missing = self.missing_offline_tracks().await?;
        if !missing.is_empty() {
            self.policy.report_refusal(
                Mode::R3,
                &format!("{} selected tracks are not downloaded yet", missing.len()),
            );
            return Err(OfflineError::OfflineSelectionIncomplete { missing });
        }
        self.policy.set_mode(Mode::R3).await
    }

    // ========================================================================
    // Assets
    // ========================================================================

    /// Queue a non-audio asset (artwork, lyrics sidecar) at P5 unless it is
    /// already stored. Returns whether a download was queued.
    #[instrument(skip(self))]
    pub async fn prefetch_asset(&self, key: &str) -> Result<bool> {
        if self.store.get_asset(key).await?.is_some() {
            return Ok(false);
        }

        let url = self
            .catalog
            .asset_url(key)
            .await?
            .ok_or_else(|| OfflineError::SourceUnavailable(format!("No URL for asset {}", key)))?;
        self.queue.enqueue(DownloadTask::asset(key, url));
        debug!(key, "Asset queued");
        Ok(true)
    }

    pub async fn get_asset(&self, key: &str) -> Result<Option<Bytes>> {
        self.store.get_asset(key).await
    }

    // ========================================================================
    // UI Surface
    // ========================================================================

    pub async fn get_track_offline_state(&self, uid: &str) -> Result<TrackOfflineState> {
        Ok(self
            .store
            .get_meta(uid)
            .await?
            .map(|meta| meta.offline_state())
            .unwrap_or_else(|| TrackOfflineState::not_cached(uid)))
    }

    /// Bytes per cache kind. Copies without a kind count as transient.
    pub async fn get_breakdown(&self) -> Result<CacheBreakdown> {
        let mut breakdown = CacheBreakdown::default();
        for meta in self.store.get_all_meta().await? {
            if !meta.has_local_copy() {
                continue;
            }
            let bytes = meta.stored_size_bytes.unwrap_or(0);
            match meta.cache_kind {
                CacheKind::Pinned => breakdown.pinned_bytes += bytes,
                CacheKind::Cloud => breakdown.cloud_bytes += bytes,
                CacheKind::Transient | CacheKind::None => breakdown.transient_bytes += bytes,
            }
        }
        Ok(breakdown)
    }

    /// Cancel all work and delete every cached blob, metadata row and asset.
    /// Listening stats and the offline selection survive.
    #[instrument(skip(self))]
    pub async fn clear_all_cache(&self) -> Result<ClearSummary> {
        self.queue.cancel_all();
        let summary = self.store.clear_all().await?;
        self.apply_selection_flags().await?;

        info!(freed_bytes = summary.freed_bytes, tracks = summary.tracks, "Cache cleared");
        self.emit(OfflineEvent::CacheCleared {
            freed_bytes: summary.freed_bytes,
            tracks: summary.tracks,
        });
        Ok(summary)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// One pass of every periodic job. Failures are logged, not propagated,
    /// so one failing job does not starve the others.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.sweep_expired().await {
            Ok(expired) => report.expired = expired,
            Err(e) => warn!(error = %e, "Cloud expiry sweep failed"),
        }
        match self.check_staleness().await {
            Ok(stale) => report.stale = stale,
            Err(e) => warn!(error = %e, "Staleness check failed"),
        }
        match self.process_re_cache().await {
            Ok(count) => report.re_cached = count,
            Err(e) => warn!(error = %e, "Re-cache scan failed"),
        }
        match self.evictor.enforce_budget().await {
            Ok(bytes) => report.evicted_bytes = bytes,
            Err(e) => warn!(error = %e, "Budget enforcement failed"),
        }

        debug!(?report, "Maintenance pass finished");
        report
    }

    /// Run [`run_maintenance`](Self::run_maintenance) on the configured
    /// interval until `shutdown` fires. The first pass runs immediately.
    pub fn spawn_maintenance(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.maintenance_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_maintenance().await;
                    }
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn meta_or_new(&self, uid: &str) -> Result<TrackMeta> {
        Ok(self
            .store
            .get_meta(uid)
            .await?
            .unwrap_or_else(|| TrackMeta::new(uid)))
    }

    async fn remote_url(&self, uid: &str, quality: Variant) -> Result<String> {
        let entry = self
            .catalog
            .entry(uid)
            .await?
            .ok_or_else(|| OfflineError::TrackNotFound(uid.to_string()))?;
        entry
            .url_for(quality)
            .map(str::to_string)
            .ok_or_else(|| {
                OfflineError::SourceUnavailable(format!("No {} URL for {}", quality, uid))
            })
    }

    async fn apply_selection_flags(&self) -> Result<()> {
        for uid in self.offline_selection() {
            let selected = self
                .store
                .get_meta(&uid)
                .await?
                .is_some_and(|meta| meta.selected_for_offline);
            if !selected {
                self.store
                    .patch_meta(&uid, &MetaPatch::new().selected_for_offline(true))
                    .await?;
            }
        }
        Ok(())
    }

    fn expiry_from(&self, now: i64) -> i64 {
        now + i64::from(self.cloud_thresholds().ttl_days) * SECONDS_PER_DAY
    }

    fn emit(&self, event: OfflineEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Offline(event)).ok();
        }
    }

    fn emit_state(&self, meta: &TrackMeta) {
        self.emit(OfflineEvent::OfflineStateChanged {
            uid: meta.uid.clone(),
            pinned: meta.pinned,
            cloud: meta.cloud,
            cached_complete: meta.cached_complete,
            needs_update: meta.needs_update,
        });
    }
}

/// Kind for a refresh download: keep the copy's kind.
fn refresh_kind(meta: &TrackMeta) -> CacheKind {
    match meta.cache_kind {
        CacheKind::None => CacheKind::Transient,
        kind => kind,
    }
}
