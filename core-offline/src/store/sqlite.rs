//! SQLite-backed cache store

use async_trait::async_trait;
use bridge_traits::{storage::StorageQuota, time::Clock};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, Transaction,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::{CacheStore, ClearSummary, MetaPatch, RecencyTracker};
use crate::error::{OfflineError, Result};
use crate::model::{AudioBlob, CacheKind, GlobalStat, QuotaEstimate, TrackMeta, Variant};

/// SQLite primary result code for a full database or disk.
const SQLITE_FULL: &str = "13";

const TOTAL_LISTEN_SECONDS: &str = "global_total_listen_seconds";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS track_meta (
        uid TEXT PRIMARY KEY NOT NULL,
        pinned INTEGER NOT NULL DEFAULT 0,
        cloud INTEGER NOT NULL DEFAULT 0,
        cache_kind TEXT NOT NULL DEFAULT 'none',
        cached_variant TEXT,
        cached_complete INTEGER NOT NULL DEFAULT 0,
        needs_update INTEGER NOT NULL DEFAULT 0,
        needs_re_cache INTEGER NOT NULL DEFAULT 0,
        cloud_added_at INTEGER,
        cloud_expires_at INTEGER,
        last_access_at INTEGER,
        stored_size_bytes INTEGER,
        selected_for_offline INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_track_meta_cache_kind ON track_meta(cache_kind)",
    "CREATE INDEX IF NOT EXISTS idx_track_meta_last_access ON track_meta(last_access_at)",
    "CREATE INDEX IF NOT EXISTS idx_track_meta_cloud_expires ON track_meta(cloud_expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS audio_blobs (
        uid TEXT PRIMARY KEY NOT NULL,
        variant TEXT NOT NULL,
        bytes BLOB NOT NULL,
        size_bytes INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        stored_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS assets (
        key TEXT PRIMARY KEY NOT NULL,
        bytes BLOB NOT NULL,
        size_bytes INTEGER NOT NULL,
        stored_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS global_stats (
        uid TEXT PRIMARY KEY NOT NULL,
        global_full_listen_count INTEGER NOT NULL DEFAULT 0,
        global_listen_seconds INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cloud_stats (
        uid TEXT PRIMARY KEY NOT NULL,
        cloud_full_listen_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS engine_counters (
        name TEXT PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

/// The cloud counter lives in `cloud_stats` so that deleting a copy does not
/// reset a track's progress towards promotion.
const SELECT_META: &str = r#"
    SELECT m.*, COALESCE(c.cloud_full_listen_count, 0) AS cloud_full_listen_count
    FROM track_meta m
    LEFT JOIN cloud_stats c ON c.uid = m.uid
"#;

const META_COLUMNS: &str = r#"
    INSERT INTO track_meta (
        uid, pinned, cloud, cache_kind, cached_variant, cached_complete,
        needs_update, needs_re_cache, cloud_added_at,
        cloud_expires_at, last_access_at, stored_size_bytes, selected_for_offline
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPSERT_META: &str = r#"
    ON CONFLICT(uid) DO UPDATE SET
        pinned = excluded.pinned,
        cloud = excluded.cloud,
        cache_kind = excluded.cache_kind,
        cached_variant = excluded.cached_variant,
        cached_complete = excluded.cached_complete,
        needs_update = excluded.needs_update,
        needs_re_cache = excluded.needs_re_cache,
        cloud_added_at = excluded.cloud_added_at,
        cloud_expires_at = excluded.cloud_expires_at,
        last_access_at = excluded.last_access_at,
        stored_size_bytes = excluded.stored_size_bytes,
        selected_for_offline = excluded.selected_for_offline
"#;

/// On an existing row a finished download only replaces the columns it
/// owns. The kind keeps the stronger of the stored and incoming kinds, and
/// only a pinned row keeps `pinned`.
const UPSERT_DOWNLOADED: &str = r#"
    ON CONFLICT(uid) DO UPDATE SET
        cached_variant = excluded.cached_variant,
        cached_complete = excluded.cached_complete,
        needs_update = excluded.needs_update,
        needs_re_cache = excluded.needs_re_cache,
        stored_size_bytes = excluded.stored_size_bytes,
        cache_kind = CASE
            WHEN pinned = 1 THEN 'pinned'
            WHEN cache_kind IN ('pinned', 'cloud') OR excluded.cache_kind IN ('pinned', 'cloud') THEN 'cloud'
            WHEN cache_kind = 'transient' OR excluded.cache_kind = 'transient' THEN 'transient'
            ELSE 'none'
        END
"#;

const UPSERT_BLOB: &str = r#"
    INSERT INTO audio_blobs (uid, variant, bytes, size_bytes, content_hash, stored_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(uid) DO UPDATE SET
        variant = excluded.variant,
        bytes = excluded.bytes,
        size_bytes = excluded.size_bytes,
        content_hash = excluded.content_hash,
        stored_at = excluded.stored_at
"#;

fn storage_error(context: &str, e: sqlx::Error) -> OfflineError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(SQLITE_FULL) {
            warn!(context, "SQLite reported a full database");
            return OfflineError::QuotaExceeded(format!("{}: storage full", context));
        }
    }
    error!(context, error = %e, "Cache store operation failed");
    OfflineError::Storage(format!("{}: {}", context, e))
}

fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Cache store persisting everything in one SQLite database.
pub struct SqliteCacheStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    recency: RecencyTracker,
    capacity_bytes: Option<u64>,
    volume: Option<Arc<dyn StorageQuota>>,
}

impl SqliteCacheStore {
    /// Create a store on an existing pool and make sure the schema exists.
    pub async fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            pool,
            clock,
            recency: RecencyTracker::new(),
            capacity_bytes: None,
            volume: None,
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OfflineError::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| storage_error("Failed to open cache database", e))?;

        info!(path = %path.display(), "Opened cache database");
        Self::new(pool, clock).await
    }

    /// In-memory store (for testing).
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| storage_error("Invalid in-memory URL", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| storage_error("Failed to open in-memory database", e))?;

        Self::new(pool, clock).await
    }

    /// Reject writes that would take the store past `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    /// Bound the quota estimate by the free space of the volume.
    pub fn with_volume(mut self, volume: Arc<dyn StorageQuota>) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error("Failed to create cache schema", e))?;
        }

        let rows = sqlx::query(
            "SELECT uid, last_access_at FROM track_meta WHERE last_access_at IS NOT NULL ORDER BY last_access_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load access order", e))?;

        for row in &rows {
            let uid: String = row.try_get("uid")?;
            let at: i64 = row.try_get("last_access_at")?;
            self.recency.touch(&uid, at);
        }

        debug!(tracked = rows.len(), "Cache store initialized");
        Ok(())
    }

    fn row_to_meta(row: &SqliteRow) -> Result<TrackMeta> {
        let cache_kind: String = row.try_get("cache_kind")?;
        let cached_variant: Option<String> = row.try_get("cached_variant")?;
        let cached_complete: i64 = row.try_get("cached_complete")?;
        let listen_count: i64 = row.try_get("cloud_full_listen_count")?;
        let stored_size: Option<i64> = row.try_get("stored_size_bytes")?;

        Ok(TrackMeta {
            uid: row.try_get("uid")?,
            pinned: row.try_get("pinned")?,
            cloud: row.try_get("cloud")?,
            cache_kind: CacheKind::from_str(&cache_kind)?,
            cached_variant: cached_variant
                .as_deref()
                .map(Variant::from_str)
                .transpose()?,
            cached_complete: cached_complete.clamp(0, 100) as u8,
            needs_update: row.try_get("needs_update")?,
            needs_re_cache: row.try_get("needs_re_cache")?,
            cloud_full_listen_count: listen_count.max(0) as u32,
            cloud_added_at: row.try_get("cloud_added_at")?,
            cloud_expires_at: row.try_get("cloud_expires_at")?,
            last_access_at: row.try_get("last_access_at")?,
            stored_size_bytes: stored_size.map(|s| s.max(0) as u64),
            selected_for_offline: row.try_get("selected_for_offline")?,
        })
    }

    async fn write_meta(
        tx: &mut Transaction<'_, Sqlite>,
        meta: &TrackMeta,
        on_conflict: &str,
    ) -> Result<()> {
        sqlx::query(&format!("{}{}", META_COLUMNS, on_conflict))
            .bind(&meta.uid)
            .bind(meta.pinned)
            .bind(meta.cloud)
            .bind(meta.cache_kind.as_str())
            .bind(meta.cached_variant.map(|v| v.as_str()))
            .bind(meta.cached_complete as i64)
            .bind(meta.needs_update)
            .bind(meta.needs_re_cache)
            .bind(meta.cloud_added_at)
            .bind(meta.cloud_expires_at)
            .bind(meta.last_access_at)
            .bind(meta.stored_size_bytes.map(|s| s as i64))
            .bind(meta.selected_for_offline)
            .execute(&mut **tx)
            .await
            .map_err(|e| storage_error("Failed to write track metadata", e))?;
        Ok(())
    }

    /// Fail with `QuotaExceeded` when replacing `replaced` bytes with
    /// `incoming` bytes would exceed the configured capacity.
    async fn check_capacity(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        incoming: u64,
        replaced: u64,
    ) -> Result<()> {
        let Some(capacity) = self.capacity_bytes else {
            return Ok(());
        };

        let used = Self::used_bytes(&mut **tx).await?;
        let after = used.saturating_sub(replaced) + incoming;
        if after > capacity {
            warn!(used, incoming, capacity, "Write rejected by store capacity");
            return Err(OfflineError::QuotaExceeded(format!(
                "{} bytes needed, {} of {} bytes in use",
                incoming, used, capacity
            )));
        }
        Ok(())
    }

    async fn used_bytes<'e, E>(executor: E) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COALESCE(SUM(size_bytes), 0) FROM audio_blobs) +
                (SELECT COALESCE(SUM(size_bytes), 0) FROM assets) AS total
            "#,
        )
        .fetch_one(executor)
        .await
        .map_err(|e| storage_error("Failed to sum stored bytes", e))?;

        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn blob_size(tx: &mut Transaction<'_, Sqlite>, uid: &str) -> Result<u64> {
        let size: Option<i64> = sqlx::query_scalar("SELECT size_bytes FROM audio_blobs WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| storage_error("Failed to read blob size", e))?;
        Ok(size.unwrap_or(0).max(0) as u64)
    }

    async fn write_blob(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        blob: &AudioBlob,
    ) -> Result<()> {
        let replaced = Self::blob_size(tx, &blob.uid).await?;
        self.check_capacity(tx, blob.size_bytes, replaced).await?;

        sqlx::query(UPSERT_BLOB)
            .bind(&blob.uid)
            .bind(blob.variant.as_str())
            .bind(blob.bytes.as_ref())
            .bind(blob.size_bytes as i64)
            .bind(calculate_hash(&blob.bytes))
            .bind(blob.stored_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| storage_error("Failed to write audio blob", e))?;
        Ok(())
    }

    async fn read_meta<'e, E>(executor: E, uid: &str) -> Result<Option<TrackMeta>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(&format!("{} WHERE m.uid = ?", SELECT_META))
            .bind(uid)
            .fetch_optional(executor)
            .await
            .map_err(|e| storage_error("Failed to read track metadata", e))?;

        row.as_ref().map(Self::row_to_meta).transpose()
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| storage_error("Failed to begin transaction", e))
    }

    async fn commit(tx: Transaction<'_, Sqlite>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| storage_error("Failed to commit transaction", e))
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put_blob(&self, uid: &str, variant: Variant, bytes: Bytes) -> Result<AudioBlob> {
        let blob = AudioBlob::new(uid, variant, bytes, self.clock.unix_timestamp());

        let mut tx = self.begin().await?;
        self.write_blob(&mut tx, &blob).await?;
        Self::commit(tx).await?;

        debug!(uid, variant = %variant, size = blob.size_bytes, "Stored audio blob");
        Ok(blob)
    }

    #[instrument(skip(self, blob, meta), fields(uid = %blob.uid, size = blob.size_bytes))]
    async fn put_blob_with_meta(&self, blob: &AudioBlob, meta: &TrackMeta) -> Result<()> {
        if blob.uid != meta.uid {
            return Err(OfflineError::Internal(format!(
                "Blob uid {} does not match meta uid {}",
                blob.uid, meta.uid
            )));
        }

        let mut tx = self.begin().await?;
        self.write_blob(&mut tx, blob).await?;
        Self::write_meta(&mut tx, meta, UPSERT_DOWNLOADED).await?;
        Self::commit(tx).await?;

        debug!(variant = %blob.variant, "Stored audio blob with metadata");
        Ok(())
    }

    async fn get_blob(&self, uid: &str) -> Result<Option<AudioBlob>> {
        let row = sqlx::query(
            "SELECT uid, variant, bytes, size_bytes, content_hash, stored_at FROM audio_blobs WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to read audio blob", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let variant: String = row.try_get("variant")?;
        let data: Vec<u8> = row.try_get("bytes")?;
        let expected_hash: String = row.try_get("content_hash")?;
        let stored_at: i64 = row.try_get("stored_at")?;

        if calculate_hash(&data) != expected_hash {
            error!(uid, "Stored blob failed checksum verification");
            return Err(OfflineError::Storage(format!("Checksum mismatch for blob {}", uid)));
        }

        Ok(Some(AudioBlob::new(
            uid,
            Variant::from_str(&variant)?,
            Bytes::from(data),
            stored_at,
        )))
    }

    async fn put_meta(&self, meta: &TrackMeta) -> Result<()> {
        let mut tx = self.begin().await?;
        Self::write_meta(&mut tx, meta, UPSERT_META).await?;
        Self::commit(tx).await
    }

    #[instrument(skip(self, patch))]
    async fn patch_meta(&self, uid: &str, patch: &MetaPatch) -> Result<TrackMeta> {
        let mut tx = self.begin().await?;

        sqlx::query("INSERT INTO track_meta (uid) VALUES (?) ON CONFLICT(uid) DO NOTHING")
            .bind(uid)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to create track metadata", e))?;

        if !patch.is_empty() {
            let mut query = QueryBuilder::<Sqlite>::new("UPDATE track_meta SET ");
            let mut set = query.separated(", ");
            if let Some(pinned) = patch.pinned {
                set.push("pinned = ").push_bind_unseparated(pinned);
            }
            if let Some(cloud) = patch.cloud {
                set.push("cloud = ").push_bind_unseparated(cloud);
            }
            if let Some(kind) = patch.cache_kind {
                set.push("cache_kind = ").push_bind_unseparated(kind.as_str());
            }
            if let Some(window) = patch.cloud_window {
                set.push("cloud_added_at = ")
                    .push_bind_unseparated(window.map(|(added, _)| added));
                set.push("cloud_expires_at = ")
                    .push_bind_unseparated(window.map(|(_, expires)| expires));
            }
            if let Some(needs_update) = patch.needs_update {
                set.push("needs_update = ").push_bind_unseparated(needs_update);
            }
            if let Some(selected) = patch.selected_for_offline {
                set.push("selected_for_offline = ").push_bind_unseparated(selected);
            }
            query.push(" WHERE uid = ").push_bind(uid);

            query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_error("Failed to update track metadata", e))?;
        }

        let meta = Self::read_meta(&mut *tx, uid)
            .await?
            .ok_or_else(|| OfflineError::Internal(format!("Metadata for {} vanished", uid)))?;
        Self::commit(tx).await?;
        Ok(meta)
    }

    async fn get_meta(&self, uid: &str) -> Result<Option<TrackMeta>> {
        Self::read_meta(&self.pool, uid).await
    }

    async fn get_all_meta(&self) -> Result<Vec<TrackMeta>> {
        let rows = sqlx::query(&format!("{} ORDER BY m.uid", SELECT_META))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to list track metadata", e))?;

        rows.iter().map(Self::row_to_meta).collect()
    }

    async fn mark_needs_re_cache(&self, uid: &str) -> Result<()> {
        sqlx::query("UPDATE track_meta SET needs_re_cache = 1 WHERE uid = ?")
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to flag re-cache", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_track(&self, uid: &str) -> Result<u64> {
        let mut tx = self.begin().await?;
        let freed = Self::blob_size(&mut tx, uid).await?;

        sqlx::query("DELETE FROM audio_blobs WHERE uid = ?")
            .bind(uid)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to delete audio blob", e))?;
        sqlx::query("DELETE FROM track_meta WHERE uid = ?")
            .bind(uid)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to delete track metadata", e))?;

        Self::commit(tx).await?;
        self.recency.forget(uid);

        debug!(uid, freed, "Deleted track");
        Ok(freed)
    }

    async fn total_bytes(&self) -> Result<u64> {
        Self::used_bytes(&self.pool).await
    }

    async fn estimate_quota(&self) -> Result<QuotaEstimate> {
        let used_bytes = self.total_bytes().await?;

        let volume_bound = match &self.volume {
            Some(volume) => match volume.available_bytes().await {
                Ok(available) => Some(used_bytes.saturating_add(available)),
                Err(e) => {
                    warn!(error = %e, "Volume query failed, ignoring it for the quota estimate");
                    None
                }
            },
            None => None,
        };

        let quota_bytes = match (self.capacity_bytes, volume_bound) {
            (Some(capacity), Some(bound)) => capacity.min(bound),
            (Some(capacity), None) => capacity,
            (None, Some(bound)) => bound,
            (None, None) => u64::MAX,
        };

        Ok(QuotaEstimate {
            used_bytes,
            quota_bytes,
        })
    }

    async fn touch(&self, uid: &str) -> Result<()> {
        let now = self.clock.unix_timestamp_millis();
        self.recency.touch(uid, now);

        sqlx::query("UPDATE track_meta SET last_access_at = ? WHERE uid = ?")
            .bind(now)
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to record access", e))?;
        Ok(())
    }

    fn lru_order(&self) -> Vec<String> {
        self.recency.oldest_first()
    }

    async fn add_listen_seconds(&self, uid: &str, seconds: u64) -> Result<()> {
        let seconds = seconds as i64;
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO global_stats (uid, global_listen_seconds) VALUES (?, ?)
            ON CONFLICT(uid) DO UPDATE SET
                global_listen_seconds = global_listen_seconds + excluded.global_listen_seconds
            "#,
        )
        .bind(uid)
        .bind(seconds)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to add listen seconds", e))?;

        sqlx::query(
            r#"
            INSERT INTO engine_counters (name, value) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = value + excluded.value
            "#,
        )
        .bind(TOTAL_LISTEN_SECONDS)
        .bind(seconds)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to add total listen seconds", e))?;

        Self::commit(tx).await
    }

    #[instrument(skip(self))]
    async fn record_full_listen(&self, uid: &str) -> Result<(GlobalStat, u32)> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO global_stats (uid, global_full_listen_count) VALUES (?, 1)
            ON CONFLICT(uid) DO UPDATE SET
                global_full_listen_count = global_full_listen_count + 1
            "#,
        )
        .bind(uid)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to count full listen", e))?;

        sqlx::query(
            r#"
            INSERT INTO cloud_stats (uid, cloud_full_listen_count) VALUES (?, 1)
            ON CONFLICT(uid) DO UPDATE SET
                cloud_full_listen_count = cloud_full_listen_count + 1
            "#,
        )
        .bind(uid)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to count cloud listen", e))?;

        let stat_row = sqlx::query(
            "SELECT global_full_listen_count, global_listen_seconds FROM global_stats WHERE uid = ?",
        )
        .bind(uid)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to read global stat", e))?;

        let cloud_count: i64 =
            sqlx::query_scalar("SELECT cloud_full_listen_count FROM cloud_stats WHERE uid = ?")
                .bind(uid)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| storage_error("Failed to read cloud counter", e))?;

        Self::commit(tx).await?;

        let full: i64 = stat_row.try_get("global_full_listen_count")?;
        let seconds: i64 = stat_row.try_get("global_listen_seconds")?;
        Ok((
            GlobalStat {
                uid: uid.to_string(),
                global_full_listen_count: full.max(0) as u64,
                global_listen_seconds: seconds.max(0) as u64,
            },
            cloud_count.max(0) as u32,
        ))
    }

    async fn get_global_stat(&self, uid: &str) -> Result<GlobalStat> {
        let row = sqlx::query(
            "SELECT global_full_listen_count, global_listen_seconds FROM global_stats WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to read global stat", e))?;

        let Some(row) = row else {
            return Ok(GlobalStat {
                uid: uid.to_string(),
                ..Default::default()
            });
        };

        let full: i64 = row.try_get("global_full_listen_count")?;
        let seconds: i64 = row.try_get("global_listen_seconds")?;
        Ok(GlobalStat {
            uid: uid.to_string(),
            global_full_listen_count: full.max(0) as u64,
            global_listen_seconds: seconds.max(0) as u64,
        })
    }

    async fn global_total_listen_seconds(&self) -> Result<u64> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM engine_counters WHERE name = ?")
            .bind(TOTAL_LISTEN_SECONDS)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to read total listen seconds", e))?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    async fn reset_cloud_stats(&self, uid: &str) -> Result<()> {
        let mut tx = self.begin().await?;

        sqlx::query("DELETE FROM cloud_stats WHERE uid = ?")
            .bind(uid)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to reset cloud counter", e))?;
        sqlx::query(
            r#"
            UPDATE track_meta SET
                cloud = 0,
                cloud_added_at = NULL,
                cloud_expires_at = NULL
            WHERE uid = ?
            "#,
        )
        .bind(uid)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to reset cloud stats", e))?;

        Self::commit(tx).await?;

        debug!(uid, "Reset cloud stats");
        Ok(())
    }

    async fn put_asset(&self, key: &str, bytes: Bytes) -> Result<()> {
        let mut tx = self.begin().await?;

        let replaced: Option<i64> = sqlx::query_scalar("SELECT size_bytes FROM assets WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to read asset size", e))?;
        self.check_capacity(&mut tx, bytes.len() as u64, replaced.unwrap_or(0).max(0) as u64)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO assets (key, bytes, size_bytes, stored_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                bytes = excluded.bytes,
                size_bytes = excluded.size_bytes,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(key)
        .bind(bytes.as_ref())
        .bind(bytes.len() as i64)
        .bind(self.clock.unix_timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to write asset", e))?;

        Self::commit(tx).await
    }

    async fn get_asset(&self, key: &str) -> Result<Option<Bytes>> {
        let data: Option<Vec<u8>> = sqlx::query_scalar("SELECT bytes FROM assets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to read asset", e))?;
        Ok(data.map(Bytes::from))
    }

    #[instrument(skip(self))]
    async fn clear_all(&self) -> Result<ClearSummary> {
        let mut tx = self.begin().await?;

        let freed_bytes = Self::used_bytes(&mut *tx).await?;
        let tracks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audio_blobs")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to count blobs", e))?;

        for table in ["audio_blobs", "track_meta", "cloud_stats", "assets"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_error("Failed to clear cache", e))?;
        }

        Self::commit(tx).await?;
        self.recency.clear();

        let summary = ClearSummary {
            freed_bytes,
            tracks: tracks.max(0) as usize,
        };
        info!(freed_bytes, tracks = summary.tracks, "Cleared cache store");
        Ok(summary)
    }
}
