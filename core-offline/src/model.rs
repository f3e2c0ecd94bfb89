//! Domain types shared by every engine component.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{OfflineError, Result};

// ============================================================================
// Variant
// ============================================================================

/// Audio quality variant of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Lo,
    Hi,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Lo => "lo",
            Variant::Hi => "hi",
        }
    }

    /// The other quality, used as the network fallback.
    pub fn other(&self) -> Variant {
        match self {
            Variant::Lo => Variant::Hi,
            Variant::Hi => Variant::Lo,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lo" => Ok(Variant::Lo),
            "hi" => Ok(Variant::Hi),
            other => Err(OfflineError::Storage(format!("Unknown variant: {}", other))),
        }
    }
}

// ============================================================================
// Cache Kind
// ============================================================================

/// Why a local copy exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    None,
    Pinned,
    Cloud,
    Transient,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::None => "none",
            CacheKind::Pinned => "pinned",
            CacheKind::Cloud => "cloud",
            CacheKind::Transient => "transient",
        }
    }

    /// How strongly a copy of this kind is retained. Higher wins when two
    /// producers want the same track.
    pub fn retention_rank(&self) -> u8 {
        match self {
            CacheKind::None => 0,
            CacheKind::Transient => 1,
            CacheKind::Cloud => 2,
            CacheKind::Pinned => 3,
        }
    }

    /// Eviction order among equally old candidates: transient copies go first.
    pub fn eviction_rank(&self) -> u8 {
        match self {
            CacheKind::Transient => 0,
            CacheKind::None => 1,
            CacheKind::Cloud => 2,
            CacheKind::Pinned => 3,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CacheKind::None),
            "pinned" => Ok(CacheKind::Pinned),
            "cloud" => Ok(CacheKind::Cloud),
            "transient" => Ok(CacheKind::Transient),
            other => Err(OfflineError::Storage(format!("Unknown cache kind: {}", other))),
        }
    }
}

// ============================================================================
// Track Metadata
// ============================================================================

/// Per-track cache state. One row per uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMeta {
    pub uid: String,
    pub pinned: bool,
    pub cloud: bool,
    pub cache_kind: CacheKind,
    pub cached_variant: Option<Variant>,
    /// 0..=100
    pub cached_complete: u8,
    pub needs_update: bool,
    pub needs_re_cache: bool,
    pub cloud_full_listen_count: u32,
    /// Unix epoch seconds.
    pub cloud_added_at: Option<i64>,
    /// Unix epoch seconds.
    pub cloud_expires_at: Option<i64>,
    /// Unix epoch milliseconds.
    pub last_access_at: Option<i64>,
    pub stored_size_bytes: Option<u64>,
    pub selected_for_offline: bool,
}

impl TrackMeta {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            pinned: false,
            cloud: false,
            cache_kind: CacheKind::None,
            cached_variant: None,
            cached_complete: 0,
            needs_update: false,
            needs_re_cache: false,
            cloud_full_listen_count: 0,
            cloud_added_at: None,
            cloud_expires_at: None,
            last_access_at: None,
            stored_size_bytes: None,
            selected_for_offline: false,
        }
    }

    /// A full local copy exists, whatever its quality.
    pub fn is_complete(&self) -> bool {
        self.cached_variant.is_some() && self.cached_complete >= 100
    }

    /// A full local copy exists at exactly `variant`.
    pub fn is_complete_at(&self, variant: Variant) -> bool {
        self.is_complete() && self.cached_variant == Some(variant)
    }

    /// Whether this track currently occupies space in the store.
    pub fn has_local_copy(&self) -> bool {
        self.cached_variant.is_some() && self.stored_size_bytes.unwrap_or(0) > 0
    }

    /// Cloud copy whose TTL has not run out at `now` (epoch seconds).
    pub fn is_cloud_valid(&self, now: i64) -> bool {
        self.cloud && self.cloud_expires_at.is_some_and(|expires| expires > now)
    }

    /// Unpinned cloud copy whose TTL has run out at `now` (epoch seconds).
    pub fn is_cloud_expired(&self, now: i64) -> bool {
        self.cloud && !self.pinned && self.cloud_expires_at.is_some_and(|expires| expires <= now)
    }

    pub fn offline_state(&self) -> TrackOfflineState {
        TrackOfflineState {
            uid: self.uid.clone(),
            pinned: self.pinned,
            cloud: self.cloud,
            cached_complete: self.cached_complete,
            needs_update: self.needs_update,
        }
    }
}

// ============================================================================
// Blobs and Stats
// ============================================================================

/// Audio bytes for one track. At most one exists per uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub uid: String,
    pub variant: Variant,
    pub bytes: Bytes,
    pub size_bytes: u64,
    /// Unix epoch seconds.
    pub stored_at: i64,
}

impl AudioBlob {
    pub fn new(uid: impl Into<String>, variant: Variant, bytes: Bytes, stored_at: i64) -> Self {
        let size_bytes = bytes.len() as u64;
        Self {
            uid: uid.into(),
            variant,
            bytes,
            size_bytes,
            stored_at,
        }
    }
}

/// Listening statistics that are never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStat {
    pub uid: String,
    pub global_full_listen_count: u64,
    pub global_listen_seconds: u64,
}

// ============================================================================
// UI-facing Views
// ============================================================================

/// Offline indicators for one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackOfflineState {
    pub uid: String,
    pub pinned: bool,
    pub cloud: bool,
    pub cached_complete: u8,
    pub needs_update: bool,
}

impl TrackOfflineState {
    pub fn not_cached(uid: impl Into<String>) -> Self {
        TrackMeta::new(uid).offline_state()
    }
}

/// Bytes used per cache kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBreakdown {
    pub pinned_bytes: u64,
    pub cloud_bytes: u64,
    pub transient_bytes: u64,
}

impl CacheBreakdown {
    pub fn total_bytes(&self) -> u64 {
        self.pinned_bytes + self.cloud_bytes + self.transient_bytes
    }
}

/// Store usage against its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEstimate {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl QuotaEstimate {
    pub fn remaining_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }

    /// Usage as a percentage of the quota.
    pub fn usage_percentage(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 100.0;
        }
        (self.used_bytes as f64 / self.quota_bytes as f64) * 100.0
    }
}
