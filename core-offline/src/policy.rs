//! # Mode Manager
//!
//! Holds the operating mode and quality/network preferences. Every mutation
//! goes through [`PolicyStore`] so the invariants below stay in one place:
//!
//! - Entering R1, R2 or R3 needs at least `min_free_space_bytes` free.
//! - Entering R3 copies `full_offline_quality` into `cache_quality`.
//! - Entering R2 remembers whether R0 or R1 was active, and
//!   [`PolicyStore::disable_dynamic_offline`] goes back to it.
//! - Network playback is never allowed in R3.

use bridge_traits::storage::{SettingsStore, StorageQuota};
use core_runtime::events::{CoreEvent, EventBus, PolicyEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::connectivity::ConnectionClass;
use crate::error::{OfflineError, Result};
use crate::model::Variant;

/// Settings key holding the JSON-encoded policy.
pub const POLICY_SETTINGS_KEY: &str = "offline.policy";

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Pure streaming.
    #[default]
    R0,
    /// Playback-window caching only.
    R1,
    /// Dynamic offline: eligible tracks are cached opportunistically.
    R2,
    /// Full offline: only the pre-selected, fully downloaded set plays.
    R3,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::R0 => "R0",
            Mode::R1 => "R1",
            Mode::R2 => "R2",
            Mode::R3 => "R3",
        }
    }

    /// Modes that write to the cache and therefore need the free-space guard.
    pub fn uses_cache(&self) -> bool {
        !matches!(self, Mode::R0)
    }

    /// Modes in which the playback window is kept warm.
    pub fn caches_window(&self) -> bool {
        matches!(self, Mode::R1 | Mode::R2)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which connection classes may carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub wifi: bool,
    pub mobile: bool,
    /// Links the host cannot classify. Fail-open by default; the app is
    /// expected to confirm with the user.
    pub allow_unknown: bool,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            wifi: true,
            mobile: false,
            allow_unknown: true,
        }
    }
}

impl NetworkPolicy {
    pub fn allows(&self, class: ConnectionClass) -> bool {
        match class {
            ConnectionClass::Wifi => self.wifi,
            ConnectionClass::Cellular => self.mobile,
            ConnectionClass::Unknown => self.allow_unknown,
            ConnectionClass::Offline => false,
        }
    }
}

/// Upper bound for cached audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheLimit {
    Megabytes(u64),
    /// A fraction of used + free space, see `OfflineConfig::auto_fraction`.
    #[default]
    Auto,
}

/// Persisted operating policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub mode: Mode,
    pub playback_quality: Variant,
    pub cache_quality: Variant,
    pub full_offline_quality: Variant,
    pub network_policy: NetworkPolicy,
    pub cache_limit: CacheLimit,
    /// R0 or R1, remembered while R2 or R3 is active.
    #[serde(default)]
    pub mode_before_dynamic: Option<Mode>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            mode: Mode::R0,
            playback_quality: Variant::Hi,
            cache_quality: Variant::Lo,
            full_offline_quality: Variant::Hi,
            network_policy: NetworkPolicy::default(),
            cache_limit: CacheLimit::Auto,
            mode_before_dynamic: None,
        }
    }
}

impl Policy {
    /// Quality the current mode plays at.
    pub fn active_playback_quality(&self) -> Variant {
        match self.mode {
            Mode::R0 | Mode::R1 => self.playback_quality,
            Mode::R2 => self.cache_quality,
            Mode::R3 => self.full_offline_quality,
        }
    }

    /// Whether playback may stream over a link of `class`.
    pub fn network_allowed(&self, class: ConnectionClass) -> bool {
        self.mode != Mode::R3 && self.network_policy.allows(class)
    }

    /// Whether background downloads may use a link of `class`.
    pub fn download_allowed(&self, class: ConnectionClass) -> bool {
        self.network_policy.allows(class)
    }
}

/// Injected owner of the [`Policy`].
pub struct PolicyStore {
    state: RwLock<Policy>,
    settings: Arc<dyn SettingsStore>,
    quota: Arc<dyn StorageQuota>,
    min_free_space_bytes: u64,
    event_bus: Option<EventBus>,
    changes: watch::Sender<Policy>,
    // Serializes read-guard-write transitions.
    transition: Mutex<()>,
}

impl PolicyStore {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        quota: Arc<dyn StorageQuota>,
        min_free_space_bytes: u64,
    ) -> Self {
        let (changes, _rx) = watch::channel(Policy::default());
        Self {
            state: RwLock::new(Policy::default()),
            settings,
            quota,
            min_free_space_bytes,
            event_bus: None,
            changes,
            transition: Mutex::new(()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Restore the persisted policy. A missing or unreadable entry keeps the
    /// defaults.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Policy> {
        let raw = self.settings.get_string(POLICY_SETTINGS_KEY).await?;

        let policy = match raw {
            Some(json) => match serde_json::from_str::<Policy>(&json) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(error = %e, "Stored policy is unreadable, using defaults");
                    Policy::default()
                }
            },
            None => Policy::default(),
        };

        *self.state.write() = policy.clone();
        self.changes.send_replace(policy.clone());
        info!(mode = %policy.mode, "Policy loaded");
        Ok(policy)
    }

    pub fn snapshot(&self) -> Policy {
        self.state.read().clone()
    }

    pub fn mode(&self) -> Mode {
        self.state.read().mode
    }

    pub fn active_playback_quality(&self) -> Variant {
        self.state.read().active_playback_quality()
    }

    pub fn cache_quality(&self) -> Variant {
        self.state.read().cache_quality
    }

    pub fn full_offline_quality(&self) -> Variant {
        self.state.read().full_offline_quality
    }

    pub fn cache_limit(&self) -> CacheLimit {
        self.state.read().cache_limit
    }

    pub fn network_allowed(&self, class: ConnectionClass) -> bool {
        self.state.read().network_allowed(class)
    }

    pub fn download_allowed(&self, class: ConnectionClass) -> bool {
        self.state.read().download_allowed(class)
    }

    /// Receiver notified after every persisted change.
    pub fn subscribe(&self) -> watch::Receiver<Policy> {
        self.changes.subscribe()
    }

    /// Switch modes, applying the free-space guard and quality sync.
    #[instrument(skip(self))]
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let _guard = self.transition.lock().await;
        let current = self.snapshot();

        if current.mode == mode {
            debug!(mode = %mode, "Mode unchanged");
            return Ok(());
        }

        if mode.uses_cache() {
            if let Err(reason) = self.check_free_space().await {
                return Err(self.refuse(mode, reason));
            }
        }

        let mut next = current.clone();
        next.mode = mode;
        next.mode_before_dynamic = match mode {
            Mode::R2 | Mode::R3 => Some(match current.mode {
                Mode::R0 | Mode::R1 => current.mode,
                _ => current.mode_before_dynamic.unwrap_or(Mode::R0),
            }),
            _ => None,
        };
        if mode == Mode::R3 {
            next.cache_quality = next.full_offline_quality;
        }

        self.commit(next).await?;
        self.emit(PolicyEvent::ModeChanged {
            from: current.mode.to_string(),
            to: mode.to_string(),
        });
        info!(from = %current.mode, to = %mode, "Mode changed");
        Ok(())
    }

    /// Leave R2 and restore the mode that was active before it.
    ///
    /// The restored mode caches no more than R2 did, so the free-space guard
    /// is not re-run. Outside R2 this is a no-op.
    #[instrument(skip(self))]
    pub async fn disable_dynamic_offline(&self) -> Result<Mode> {
        let _guard = self.transition.lock().await;
        let current = self.snapshot();

        if current.mode != Mode::R2 {
            return Ok(current.mode);
        }

        let restored = current.mode_before_dynamic.unwrap_or(Mode::R0);
        let mut next = current.clone();
        next.mode = restored;
        next.mode_before_dynamic = None;

        self.commit(next).await?;
        self.emit(PolicyEvent::ModeChanged {
            from: Mode::R2.to_string(),
            to: restored.to_string(),
        });
        info!(restored = %restored, "Dynamic offline disabled");
        Ok(restored)
    }

    pub async fn set_playback_quality(&self, quality: Variant) -> Result<()> {
        self.update(|policy| policy.playback_quality = quality).await
    }

    pub async fn set_cache_quality(&self, quality: Variant) -> Result<()> {
        self.update(|policy| policy.cache_quality = quality).await
    }

    /// In R3 the cache quality follows.
    pub async fn set_full_offline_quality(&self, quality: Variant) -> Result<()> {
        self.update(|policy| {
            policy.full_offline_quality = quality;
            if policy.mode == Mode::R3 {
                policy.cache_quality = quality;
            }
        })
        .await
    }

    pub async fn set_network_policy(&self, network_policy: NetworkPolicy) -> Result<()> {
        self.update(|policy| policy.network_policy = network_policy).await
    }

    pub async fn set_cache_limit(&self, limit: CacheLimit) -> Result<()> {
        if limit == CacheLimit::Megabytes(0) {
            return Err(OfflineError::Config(
                "Cache limit must be at least 1 MB".to_string(),
            ));
        }
        self.update(|policy| policy.cache_limit = limit).await
    }

    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Policy),
    {
        let _guard = self.transition.lock().await;
        let mut next = self.snapshot();
        apply(&mut next);
        self.commit(next).await
    }

    /// Persist first, then publish in memory.
    async fn commit(&self, next: Policy) -> Result<()> {
        let json = serde_json::to_string(&next)?;
        self.settings.set_string(POLICY_SETTINGS_KEY, &json).await?;

        *self.state.write() = next.clone();
        let mode = next.mode;
        self.changes.send_replace(next);
        self.emit(PolicyEvent::Changed {
            mode: mode.to_string(),
        });
        Ok(())
    }

    async fn check_free_space(&self) -> std::result::Result<(), String> {
        match self.quota.available_bytes().await {
            Ok(available) if available >= self.min_free_space_bytes => Ok(()),
            Ok(available) => Err(format!(
                "Not enough free space: {} MB available, {} MB required",
                available / (1024 * 1024),
                self.min_free_space_bytes / (1024 * 1024)
            )),
            Err(e) => Err(format!("Unable to determine free space: {}", e)),
        }
    }

    fn refuse(&self, requested: Mode, reason: String) -> OfflineError {
        self.report_refusal(requested, &reason);
        OfflineError::ModeTransitionRefused { reason }
    }

    /// Log and publish a refused transition to `requested`.
    pub(crate) fn report_refusal(&self, requested: Mode, reason: &str) {
        let current = self.mode();
        warn!(current = %current, requested = %requested, reason, "Mode change refused");
        self.emit(PolicyEvent::ModeRefused {
            current: current.to_string(),
            requested: requested.to_string(),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: PolicyEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Policy(event)).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_playback_quality_per_mode() {
        let mut policy = Policy {
            playback_quality: Variant::Hi,
            cache_quality: Variant::Lo,
            full_offline_quality: Variant::Hi,
            ..Policy::default()
        };

        policy.mode = Mode::R0;
        assert_eq!(policy.active_playback_quality(), Variant::Hi);
        policy.mode = Mode::R1;
        assert_eq!(policy.active_playback_quality(), Variant::Hi);
        policy.mode = Mode::R2;
        assert_eq!(policy.active_playback_quality(), Variant::Lo);
        policy.mode = Mode::R3;
        assert_eq!(policy.active_playback_quality(), Variant::Hi);
    }

    #[test]
    fn test_network_allowed() {
        let mut policy = Policy::default();

        assert!(policy.network_allowed(ConnectionClass::Wifi));
        assert!(!policy.network_allowed(ConnectionClass::Cellular));
        assert!(policy.network_allowed(ConnectionClass::Unknown));
        assert!(!policy.network_allowed(ConnectionClass::Offline));

        policy.mode = Mode::R3;
        assert!(!policy.network_allowed(ConnectionClass::Wifi));
        assert!(policy.download_allowed(ConnectionClass::Wifi));
    }

    #[test]
    fn test_policy_json_round_trip() {
        let policy = Policy {
            mode: Mode::R2,
            cache_limit: CacheLimit::Megabytes(512),
            mode_before_dynamic: Some(Mode::R1),
            ..Policy::default()
        };

        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(serde_json::from_str::<Policy>(&json).unwrap(), policy);
    }
}
