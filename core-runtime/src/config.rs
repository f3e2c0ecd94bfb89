//! # Engine Configuration Module
//!
//! Collects the platform bridges and host settings the offline cache engine
//! needs before it can start.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `EngineConfig`. It enforces fail-fast validation so a host learns about a
//! missing capability at startup rather than on the first download.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - Streamed audio fetches
//! - `SettingsStore` - Policy, thresholds and offline selection
//! - `StorageQuota` - Free-space probe for the mode guard and `auto` limit
//!
//! ## Optional Dependencies
//!
//! - `NetworkMonitor` - Connection class and online/offline changes. Without
//!   it the engine treats the link as "unknown".
//! - `Clock` - Defaults to [`SystemClock`]
//! - `LoggerSink` - Mirror logs into the host pipeline
//!
//! When the `desktop-shims` feature is enabled, desktop defaults from
//! `bridge-desktop` are injected for every bridge that was not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{EngineConfig, PlatformClass};
//! use std::sync::Arc;
//!
//! let config = EngineConfig::builder()
//!     .database_path("/data/offline-cache.db")
//!     .platform(PlatformClass::Mobile)
//!     .http_client(Arc::new(MyHttpClient))
//!     .settings_store(Arc::new(MySettingsStore))
//!     .storage_quota(Arc::new(MyQuota))
//!     .build()
//!     .await?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use crate::logging::LoggingConfig;
use bridge_traits::{
    Clock, HttpClient, LoggerSink, NetworkMonitor, SettingsStore, StorageQuota, SystemClock,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Broad class of the host platform.
///
/// Drives defaults that depend on radio and battery constraints, such as the
/// pause inserted between background downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlatformClass {
    /// Phones and tablets
    Mobile,
    /// Browsers and web views
    Web,
    /// Desktop operating systems
    #[default]
    Desktop,
}

/// Engine configuration.
///
/// Holds every bridge and host setting the engine needs. Use
/// [`EngineConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database holding blobs, metadata and stats
    pub database_path: PathBuf,

    /// Host platform class
    pub platform: PlatformClass,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,

    /// HTTP client for audio and asset downloads
    pub http_client: Arc<dyn HttpClient>,

    /// Persistent settings (policy, thresholds, offline selection)
    pub settings_store: Arc<dyn SettingsStore>,

    /// Free-space probe of the cache volume
    pub storage_quota: Arc<dyn StorageQuota>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Host logging pipeline (optional)
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database_path", &self.database_path)
            .field("platform", &self.platform)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("http_client", &"HttpClient { ... }")
            .field("settings_store", &"SettingsStore { ... }")
            .field("storage_quota", &"StorageQuota { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .finish()
    }
}

impl EngineConfig {
    /// Creates a new builder for constructing an `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Default logging setup that mirrors into the host sink, if one was
    /// provided.
    pub fn logging_config(&self) -> LoggingConfig {
        match &self.logger_sink {
            Some(sink) => LoggingConfig::default().with_logger_sink(sink.clone()),
            None => LoggingConfig::default(),
        }
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Default bridges
// ============================================================================

#[cfg(not(feature = "desktop-shims"))]
fn capability_missing(capability: &str, purpose: &str, mobile: &str, web: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: format!(
            "{capability} implementation is required for {purpose}. \
             Desktop: enable the 'desktop-shims' feature to use the default implementation. \
             Mobile: inject {mobile}. \
             Web: inject {web}."
        ),
    }
}

#[cfg(feature = "desktop-shims")]
fn default_database_path() -> Result<PathBuf> {
    Ok(bridge_desktop::paths::default_cache_db_path())
}

#[cfg(not(feature = "desktop-shims"))]
fn default_database_path() -> Result<PathBuf> {
    Err(Error::Config(
        "Database path is required. Use .database_path() to set it.".to_string(),
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Ok(Arc::new(bridge_desktop::ReqwestHttpClient::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(capability_missing(
        "HttpClient",
        "downloading audio",
        "a URLSession/OkHttp based client",
        "a fetch()-based client",
    ))
}

#[cfg(feature = "desktop-shims")]
async fn provide_default_settings_store(database_path: &Path) -> Result<Arc<dyn SettingsStore>> {
    let path = database_path
        .parent()
        .map(|parent| parent.join("settings.db"))
        .unwrap_or_else(bridge_desktop::paths::default_settings_db_path);

    let store = bridge_desktop::SqliteSettingsStore::new(path).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
async fn provide_default_settings_store(_database_path: &Path) -> Result<Arc<dyn SettingsStore>> {
    Err(capability_missing(
        "SettingsStore",
        "persisting the offline policy",
        "platform-native settings (UserDefaults/DataStore)",
        "a localStorage-based settings store",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_storage_quota(database_path: &Path) -> Result<Arc<dyn StorageQuota>> {
    let dir = database_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(bridge_desktop::paths::default_data_dir);
    Ok(Arc::new(bridge_desktop::DiskStorageQuota::for_path(dir)))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_storage_quota(_database_path: &Path) -> Result<Arc<dyn StorageQuota>> {
    Err(capability_missing(
        "StorageQuota",
        "the free-space guard and the auto cache limit",
        "a volume capacity probe",
        "a navigator.storage.estimate() probe",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    Some(Arc::new(bridge_desktop::DesktopNetworkMonitor::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    None
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for constructing [`EngineConfig`] instances.
#[derive(Default)]
pub struct EngineConfigBuilder {
    database_path: Option<PathBuf>,
    platform: Option<PlatformClass>,
    event_buffer_size: Option<usize>,
    http_client: Option<Arc<dyn HttpClient>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    storage_quota: Option<Arc<dyn StorageQuota>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
}

impl EngineConfigBuilder {
    /// Sets the path of the cache database.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::EngineConfig;
    ///
    /// let builder = EngineConfig::builder()
    ///     .database_path("/data/offline-cache.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the platform class. Defaults to [`PlatformClass::Desktop`].
    pub fn platform(mut self, platform: PlatformClass) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Sets the event bus capacity.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets the HTTP client implementation.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the settings store implementation (required).
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Sets the free-space probe (required).
    pub fn storage_quota(mut self, quota: Arc<dyn StorageQuota>) -> Self {
        self.storage_quota = Some(quota);
        self
    }

    /// Sets the network monitor implementation (optional).
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Sets the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the host logger sink.
    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    /// Builds the final `EngineConfig` instance.
    ///
    /// Async because the desktop settings store opens its database here.
    ///
    /// # Errors
    ///
    /// - `Error::CapabilityMissing` when a required bridge is absent and no
    ///   desktop default is available
    /// - `Error::Config` for invalid values
    pub async fn build(self) -> Result<EngineConfig> {
        let database_path = match self.database_path {
            Some(path) => path,
            None => default_database_path()?,
        };

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => provide_default_settings_store(&database_path).await?,
        };

        let storage_quota = match self.storage_quota {
            Some(quota) => quota,
            None => provide_default_storage_quota(&database_path)?,
        };

        let config = EngineConfig {
            database_path,
            platform: self.platform.unwrap_or_default(),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            http_client,
            settings_store,
            storage_quota,
            network_monitor: self
                .network_monitor
                .or_else(provide_default_network_monitor),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
        };

        config.validate()?;

        Ok(config)
    }
}
