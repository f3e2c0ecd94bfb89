//! # Cache Store
//!
//! Durable persistence of audio blobs, per-track metadata, listening stats
//! and small non-audio assets.
//!
//! ## Guarantees
//!
//! - At most one audio blob exists per uid; writing a new variant replaces it.
//! - A blob and the metadata describing it are committed in one transaction.
//! - Deleting a track also drops it from recency tracking. Its cloud
//!   listen counter survives until [`CacheStore::reset_cloud_stats`] or
//!   [`CacheStore::clear_all`].
//! - Writers update only the columns they own: the download queue through
//!   [`CacheStore::put_blob_with_meta`], the offline manager through
//!   [`CacheStore::patch_meta`], the stats core through the listen counters.
//! - A write that does not fit returns [`OfflineError::QuotaExceeded`]
//!   instead of being dropped; callers evict and retry.
//!
//! [`OfflineError::QuotaExceeded`]: crate::error::OfflineError::QuotaExceeded

mod recency;
mod sqlite;

pub use recency::RecencyTracker;
pub use sqlite::SqliteCacheStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::{AudioBlob, CacheKind, GlobalStat, QuotaEstimate, TrackMeta, Variant};

/// Outcome of [`CacheStore::clear_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearSummary {
    pub freed_bytes: u64,
    pub tracks: usize,
}

/// Column-scoped update of the lifecycle fields the offline manager owns.
/// Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaPatch {
    pub pinned: Option<bool>,
    pub cloud: Option<bool>,
    pub cache_kind: Option<CacheKind>,
    /// `(added_at, expires_at)` in epoch seconds, or `None` to clear both.
    pub cloud_window: Option<Option<(i64, i64)>>,
    pub needs_update: Option<bool>,
    pub selected_for_offline: Option<bool>,
}

impl MetaPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = Some(pinned);
        self
    }

    pub fn cloud(mut self, cloud: bool) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn cache_kind(mut self, kind: CacheKind) -> Self {
        self.cache_kind = Some(kind);
        self
    }

    pub fn cloud_window(mut self, added_at: i64, expires_at: i64) -> Self {
        self.cloud_window = Some(Some((added_at, expires_at)));
        self
    }

    pub fn needs_update(mut self, needs_update: bool) -> Self {
        self.needs_update = Some(needs_update);
        self
    }

    pub fn selected_for_offline(mut self, selected: bool) -> Self {
        self.selected_for_offline = Some(selected);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Storage backend for the offline engine.
#[async_trait]
pub trait CacheStore: Send + Sync {
    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Store audio for `uid`, replacing any blob it already has.
    async fn put_blob(&self, uid: &str, variant: Variant, bytes: Bytes) -> Result<AudioBlob>;

    /// Store a blob and its metadata atomically.
    ///
    /// A new row takes `meta` as given. On an existing row only the
    /// download columns (variant, completion, size, update flags) are
    /// replaced and the cache kind is merged with the stored one, so
    /// lifecycle flags and counters written meanwhile are kept.
    async fn put_blob_with_meta(&self, blob: &AudioBlob, meta: &TrackMeta) -> Result<()>;

    async fn get_blob(&self, uid: &str) -> Result<Option<AudioBlob>>;

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Write every metadata column except the cloud listen counter.
    async fn put_meta(&self, meta: &TrackMeta) -> Result<()>;

    /// Apply `patch` to the row of `uid`, creating it if missing, and
    /// return the row afterwards.
    async fn patch_meta(&self, uid: &str, patch: &MetaPatch) -> Result<TrackMeta>;

    async fn get_meta(&self, uid: &str) -> Result<Option<TrackMeta>>;

    async fn get_all_meta(&self) -> Result<Vec<TrackMeta>>;

    /// Flag a track for a proper re-download without touching other fields.
    async fn mark_needs_re_cache(&self, uid: &str) -> Result<()>;

    /// Remove blob and metadata. Returns the bytes freed. Listen counters
    /// are kept.
    async fn delete_track(&self, uid: &str) -> Result<u64>;

    // ------------------------------------------------------------------
    // Usage and recency
    // ------------------------------------------------------------------

    /// Bytes held by blobs and assets.
    async fn total_bytes(&self) -> Result<u64>;

    async fn estimate_quota(&self) -> Result<QuotaEstimate>;

    /// Record an access for LRU ordering.
    async fn touch(&self, uid: &str) -> Result<()>;

    /// Tracked uids, least recently accessed first.
    fn lru_order(&self) -> Vec<String>;

    // ------------------------------------------------------------------
    // Listening stats
    // ------------------------------------------------------------------

    async fn add_listen_seconds(&self, uid: &str, seconds: u64) -> Result<()>;

    /// Count one full listen. Returns the global stat and the cloud-facing
    /// counter after the increment.
    async fn record_full_listen(&self, uid: &str) -> Result<(GlobalStat, u32)>;

    async fn get_global_stat(&self, uid: &str) -> Result<GlobalStat>;

    async fn global_total_listen_seconds(&self) -> Result<u64>;

    /// Reset the cloud counter and TTL of a track. Global stats are kept.
    async fn reset_cloud_stats(&self, uid: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    async fn put_asset(&self, key: &str, bytes: Bytes) -> Result<()>;

    async fn get_asset(&self, key: &str) -> Result<Option<Bytes>>;

    /// Delete blobs, metadata, cloud counters and assets. Global stats
    /// survive.
    async fn clear_all(&self) -> Result<ClearSummary>;
}
