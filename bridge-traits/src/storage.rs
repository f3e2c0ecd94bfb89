//! Storage Abstractions
//!
//! Key-value settings persistence and the free-space probe used by the mode
//! guard and the `auto` cache limit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Space on the volume holding the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpace {
    /// Total capacity of the volume in bytes
    pub total_bytes: u64,
    /// Bytes the app may still write
    pub available_bytes: u64,
}

impl VolumeSpace {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        Self {
            total_bytes,
            available_bytes: available_bytes.min(total_bytes),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }
}

/// Free-space probe for the cache volume.
///
/// - Desktop: disk statistics of the mount containing the cache database
/// - iOS: `volumeAvailableCapacityForImportantUsage`
/// - Android: `StorageStatsManager`
/// - Web: `navigator.storage.estimate()`
#[async_trait]
pub trait StorageQuota: Send + Sync {
    /// Current space on the cache volume.
    async fn volume_space(&self) -> Result<VolumeSpace>;

    /// Bytes still available for writing.
    async fn available_bytes(&self) -> Result<u64> {
        Ok(self.volume_space().await?.available_bytes)
    }
}

/// Key-value settings storage trait
///
/// Abstracts platform-specific preferences storage:
/// - iOS: UserDefaults
/// - Android: SharedPreferences / DataStore
/// - Desktop: SQLite key-value table
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SettingsStore;
///
/// async fn save_threshold(store: &dyn SettingsStore) -> Result<()> {
///     store.set_i64("offline.cloud.threshold", 3).await?;
///     store.set_bool("offline.network.mobile", false).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Store a string value
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Retrieve a string value
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Store a boolean value
    async fn set_bool(&self, key: &str, value: bool) -> Result<()>;

    /// Retrieve a boolean value
    async fn get_bool(&self, key: &str) -> Result<Option<bool>>;

    /// Store an integer value
    async fn set_i64(&self, key: &str, value: i64) -> Result<()>;

    /// Retrieve an integer value
    async fn get_i64(&self, key: &str) -> Result<Option<i64>>;

    /// Delete a setting
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a setting exists
    async fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_string(key).await.ok().flatten().is_some())
    }

    /// List all setting keys
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Clear all settings
    async fn clear_all(&self) -> Result<()>;
}
