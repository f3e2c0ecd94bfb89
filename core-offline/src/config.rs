//! Engine tunables.

use std::time::Duration;

use crate::error::{OfflineError, Result};
use crate::queue::BackgroundProfile;

/// 60 MB of free space is required before any caching mode is entered.
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 60 * 1024 * 1024;

/// Configuration for the offline cache engine.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Free space the volume must report before R1/R2/R3 can be entered.
    pub min_free_space_bytes: u64,

    /// Full listens needed before a track is promoted to cloud (N).
    pub cloud_listen_threshold: u32,

    /// Days a cloud copy lives before the sweep removes it (D).
    pub cloud_ttl_days: u32,

    /// Share of used + free space the cache may occupy when the limit is `Auto`.
    pub auto_fraction: f64,

    /// Declared and stored sizes may differ by this much before a copy is stale.
    pub staleness_tolerance_bytes: u64,

    /// Retries before a failing download is dropped.
    pub max_retries: u32,

    /// First retry delay; doubled on every further retry.
    pub retry_base_delay: Duration,

    /// Upper bound for the retry delay.
    pub retry_max_delay: Duration,

    /// A download that delivers no bytes for this long is aborted.
    pub stall_timeout: Duration,

    /// Parallel non-audio downloads.
    pub asset_concurrency: usize,

    /// Pause between downloads. `None` picks one from the platform class.
    pub background_profile: Option<BackgroundProfile>,

    /// How often expiry, staleness and budget sweeps run.
    pub maintenance_interval: Duration,

    /// Progress events for streams of unknown length fire every this many bytes.
    pub progress_interval_bytes: u64,

    /// Buffer size for each read from a download stream.
    pub read_chunk_size: usize,

    /// Hard capacity of the blob store. `None` leaves it to the volume.
    pub store_capacity_bytes: Option<u64>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            cloud_listen_threshold: 3,
            cloud_ttl_days: 30,
            auto_fraction: 0.5,
            staleness_tolerance_bytes: 4 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
            asset_concurrency: 2,
            background_profile: None,
            maintenance_interval: Duration::from_secs(60 * 60),
            progress_interval_bytes: 256 * 1024,
            read_chunk_size: 64 * 1024,
            store_capacity_bytes: None,
        }
    }
}

impl OfflineConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space_bytes = bytes;
        self
    }

    /// Set the cloud promotion threshold and TTL.
    pub fn with_cloud_thresholds(mut self, listens: u32, ttl_days: u32) -> Self {
        self.cloud_listen_threshold = listens;
        self.cloud_ttl_days = ttl_days;
        self
    }

    pub fn with_auto_fraction(mut self, fraction: f64) -> Self {
        self.auto_fraction = fraction;
        self
    }

    pub fn with_staleness_tolerance(mut self, bytes: u64) -> Self {
        self.staleness_tolerance_bytes = bytes;
        self
    }

    /// Set retry count and backoff bounds.
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self.retry_max_delay = max_delay;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_asset_concurrency(mut self, count: usize) -> Self {
        self.asset_concurrency = count;
        self
    }

    pub fn with_background_profile(mut self, profile: BackgroundProfile) -> Self {
        self.background_profile = Some(profile);
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_store_capacity(mut self, bytes: u64) -> Self {
        self.store_capacity_bytes = Some(bytes);
        self
    }

    /// Backoff before retry number `retries + 1`: `base * 2^retries`, capped.
    pub fn backoff_for(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cloud_listen_threshold == 0 {
            return Err(OfflineError::Config(
                "cloud_listen_threshold must be at least 1".to_string(),
            ));
        }

        if self.cloud_ttl_days == 0 {
            return Err(OfflineError::Config(
                "cloud_ttl_days must be at least 1".to_string(),
            ));
        }

        if !(self.auto_fraction > 0.0 && self.auto_fraction <= 1.0) {
            return Err(OfflineError::Config(
                "auto_fraction must be in (0, 1]".to_string(),
            ));
        }

        if self.asset_concurrency == 0 {
            return Err(OfflineError::Config(
                "asset_concurrency must be at least 1".to_string(),
            ));
        }

        if self.read_chunk_size == 0 {
            return Err(OfflineError::Config(
                "read_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.stall_timeout.is_zero() {
            return Err(OfflineError::Config(
                "stall_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(OfflineError::Config(
                "retry_base_delay cannot exceed retry_max_delay".to_string(),
            ));
        }

        Ok(())
    }
}
