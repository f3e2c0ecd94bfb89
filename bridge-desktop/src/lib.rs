//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` with streamed bodies
//! - `NetworkMonitor` using a TCP reachability probe
//! - `SettingsStore` using SQLite-backed key-value store
//! - `StorageQuota` using the OS disk list from `sysinfo`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DiskStorageQuota, ReqwestHttpClient, paths};
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new();
//!     let quota = DiskStorageQuota::for_path(paths::default_data_dir());
//!
//!     // Use in engine configuration
//! }
//! ```

mod http;
mod network;
pub mod paths;
mod quota;
mod settings;

pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
pub use quota::DiskStorageQuota;
pub use settings::SqliteSettingsStore;
