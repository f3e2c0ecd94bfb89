//! # Offline Engine Error Types
//!
//! Error taxonomy for the cache store, download queue, mode manager and
//! offline manager.

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Errors that can occur in the offline cache engine.
#[derive(Error, Debug)]
pub enum OfflineError {
    // ========================================================================
    // Network Errors
    // ========================================================================
    /// Fetch failed or timed out. Retried with backoff by the queue.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Network use is disallowed by the current mode or network policy.
    #[error("Network blocked by policy: {0}")]
    PolicyBlocked(String),

    // ========================================================================
    // Storage Errors
    // ========================================================================
    /// A write would exceed the cache capacity.
    #[error("Cache quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Declared remote size and stored size diverge.
    #[error("Integrity mismatch for {uid}: declared {declared_bytes} bytes, stored {stored_bytes} bytes")]
    IntegrityMismatch {
        uid: String,
        declared_bytes: u64,
        stored_bytes: u64,
    },

    // ========================================================================
    // Playback Resolution Errors
    // ========================================================================
    /// Nothing playable was found for the track.
    #[error("No playable source for track {0}")]
    SourceUnavailable(String),

    /// Track is not known to the catalog.
    #[error("Track not found in catalog: {0}")]
    TrackNotFound(String),

    // ========================================================================
    // Mode Errors
    // ========================================================================
    /// Mode change was rejected; the previous mode stays active.
    #[error("Mode transition refused: {reason}")]
    ModeTransitionRefused { reason: String },

    /// Full offline mode requires every selected track to be complete.
    #[error("Offline selection incomplete: {} track(s) missing", missing.len())]
    OfflineSelectionIncomplete { missing: Vec<String> },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// Operation was aborted.
    #[error("Operation cancelled")]
    Cancelled,

    /// Host bridge failure.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OfflineError {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OfflineError::TransientNetwork(_) => true,
            OfflineError::Bridge(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if the engine recovers on its own once the blocking
    /// condition clears (network re-admitted, space reclaimed).
    pub fn is_recoverable(&self) -> bool {
        self.is_transient()
            || matches!(
                self,
                OfflineError::PolicyBlocked(_) | OfflineError::QuotaExceeded(_)
            )
    }

    /// Returns `true` if this error is due to network issues.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            OfflineError::TransientNetwork(_) | OfflineError::PolicyBlocked(_)
        ) || matches!(
            self,
            OfflineError::Bridge(
                BridgeError::Network(_) | BridgeError::Timeout(_) | BridgeError::HttpStatus { .. }
            )
        )
    }
}

impl From<sqlx::Error> for OfflineError {
    fn from(e: sqlx::Error) -> Self {
        OfflineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for OfflineError {
    fn from(e: serde_json::Error) -> Self {
        OfflineError::Internal(format!("Serialization failed: {}", e))
    }
}

/// Result type for offline engine operations.
pub type Result<T> = std::result::Result<T, OfflineError>;
