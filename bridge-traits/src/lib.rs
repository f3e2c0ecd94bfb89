//! # Host Bridge Traits
//!
//! Platform abstraction traits that each host must implement for the offline
//! cache engine.
//!
//! ## Overview
//!
//! The engine never talks to sockets, disks or OS connectivity APIs directly.
//! Every capability it needs is described here as a trait and injected at
//! construction time, which keeps the core testable and portable across
//! desktop, mobile and web hosts.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Streamed audio fetches and small requests
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connection type and online/offline changes
//!
//! ### Storage
//! - [`SettingsStore`](storage::SettingsStore) - Key-value persistence for policy and thresholds
//! - [`StorageQuota`](storage::StorageQuota) - Free/total space estimate of the cache volume
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic TTL and LRU tests
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ In Progress |
//! | iOS      | TBD                 | 📋 Planned |
//! | Android  | TBD                 | 📋 Planned |
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is
//! missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let quota = config.storage_quota
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "StorageQuota".to_string(),
//!         message: "Inject a platform free-space probe.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and include actionable context.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across the
//! engine's background tasks behind `Arc`.

pub mod error;
pub mod http;
pub mod network;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{DownloadStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use storage::{SettingsStore, StorageQuota, VolumeSpace};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
