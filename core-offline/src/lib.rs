//! # Offline Cache Engine
//!
//! Decides for every track whether it plays from the network or from a local
//! copy, keeps a bounded local store of audio fresh and within quota, and
//! fetches upcoming tracks ahead of time.
//!
//! ## Overview
//!
//! - [`policy`]: operating modes R0 to R3, quality selection and network
//!   policy, persisted through the host settings store
//! - [`store`]: durable blobs, per-track metadata and listening stats (SQLite)
//! - [`queue`]: single-flight priority download queue with backoff
//! - [`resolver`]: picks local copy or network URL for playback
//! - [`window`]: keeps the previous, current and next track warm
//! - [`manager`]: pinned and cloud lifecycle, eviction and maintenance
//! - [`stats`]: listening time and full-listen detection
//! - [`connectivity`]: classification of the platform network state

pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod manager;
pub mod model;
pub mod policy;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod stats;
pub mod store;
pub mod window;

pub use catalog::{CatalogEntry, StaticCatalog, TrackCatalog};
pub use config::OfflineConfig;
pub use connectivity::{classify, ConnectionClass, Connectivity};
pub use error::{OfflineError, Result};
pub use manager::{CloudThresholds, Evictor, MaintenanceReport, OfflineManager};
pub use model::{
    AudioBlob, CacheBreakdown, CacheKind, GlobalStat, QuotaEstimate, TrackMeta, TrackOfflineState,
    Variant,
};
pub use policy::{CacheLimit, Mode, NetworkPolicy, Policy, PolicyStore};
pub use progress::DownloadProgress;
pub use queue::{
    BackgroundProfile, DownloadQueue, DownloadTask, EnqueueOutcome, NetworkGate, Priority,
    QueueStatus, TaskInfo, TaskKey,
};
pub use resolver::{PlaybackSource, ResolvedSource, ResolvedSummary, TrackResolver};
pub use stats::{FullListenSignal, StatsCore};
pub use store::{CacheStore, ClearSummary, MetaPatch, SqliteCacheStore};
pub use window::{Direction, PlaybackWindow, ProtectedSet, WindowSlots};
