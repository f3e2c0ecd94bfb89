//! Quota-driven eviction
//!
//! The budget is the configured cache limit, or in `Auto` mode a fraction of
//! the space the cache could grow into (its own usage plus the free space of
//! the volume). The store's own hard capacity caps either. When the volume
//! cannot be read the `Auto` budget is the current usage.
//!
//! Candidates are local copies that are neither pinned, selected for full
//! offline, nor in the playback window. They go least recently accessed
//! first; tracks the LRU tracker has never seen count as oldest, and
//! transient copies go before cloud copies on ties.

use async_trait::async_trait;
use bridge_traits::storage::StorageQuota;
use core_runtime::events::{CoreEvent, EventBus, OfflineEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};
use crate::model::TrackMeta;
use crate::policy::{CacheLimit, PolicyStore};
use crate::queue::CapacityGuard;
use crate::store::CacheStore;
use crate::window::ProtectedSet;

const MIB: u64 = 1024 * 1024;

pub struct Evictor {
    store: Arc<dyn CacheStore>,
    policy: Arc<PolicyStore>,
    quota: Arc<dyn StorageQuota>,
    protected: ProtectedSet,
    auto_fraction: f64,
    event_bus: Option<EventBus>,
    // One eviction pass at a time.
    pass: Mutex<()>,
}

impl Evictor {
    pub fn new(
        store: Arc<dyn CacheStore>,
        policy: Arc<PolicyStore>,
        quota: Arc<dyn StorageQuota>,
        protected: ProtectedSet,
        config: &OfflineConfig,
    ) -> Self {
        Self {
            store,
            policy,
            quota,
            protected,
            auto_fraction: config.auto_fraction,
            event_bus: None,
            pass: Mutex::new(()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Bytes the cache may occupy.
    pub async fn budget_bytes(&self) -> Result<u64> {
        let used = self.store.total_bytes().await?;

        let limit = match self.policy.cache_limit() {
            CacheLimit::Megabytes(mb) => mb.saturating_mul(MIB),
            CacheLimit::Auto => match self.quota.available_bytes().await {
                Ok(available) => (used.saturating_add(available) as f64 * self.auto_fraction) as u64,
                // Without a free-space reading the cache neither grows nor shrinks.
                Err(e) => {
                    warn!(error = %e, used_bytes = used, "Free space unknown, auto budget held at current usage");
                    used
                }
            },
        };

        let hard_cap = self.store.estimate_quota().await?.quota_bytes;
        Ok(limit.min(hard_cap))
    }

    /// Evict until the cache fits its budget. Returns the bytes freed.
    #[instrument(skip(self))]
    pub async fn enforce_budget(&self) -> Result<u64> {
        let _pass = self.pass.lock().await;
        let budget = self.budget_bytes().await?;
        let used = self.store.total_bytes().await?;
        let (freed, _) = self.evict_down_to(used, budget, None).await?;
        Ok(freed)
    }

    /// Eligible tracks in eviction order.
    pub async fn candidates(&self, exclude: Option<&str>) -> Result<Vec<TrackMeta>> {
        let lru: HashMap<String, usize> = self
            .store
            .lru_order()
            .into_iter()
            .enumerate()
            .map(|(position, uid)| (uid, position + 1))
            .collect();

        let mut candidates: Vec<TrackMeta> = self
            .store
            .get_all_meta()
            .await?
            .into_iter()
            .filter(|meta| meta.has_local_copy())
            .filter(|meta| !meta.pinned && !meta.selected_for_offline)
            .filter(|meta| !self.protected.contains(&meta.uid))
            .filter(|meta| Some(meta.uid.as_str()) != exclude)
            .collect();

        candidates.sort_by_key(|meta| {
            (
                lru.get(&meta.uid).copied().unwrap_or(0),
                meta.cache_kind.eviction_rank(),
            )
        });
        Ok(candidates)
    }

    /// Delete candidates until `used` is at most `target`. Returns the bytes
    /// freed and the usage afterwards.
    async fn evict_down_to(&self, mut used: u64, target: u64, exclude: Option<&str>) -> Result<(u64, u64)> {
        if used <= target {
            return Ok((0, used));
        }

        let mut freed = 0u64;
        for meta in self.candidates(exclude).await? {
            if used <= target {
                break;
            }

            let bytes = self.store.delete_track(&meta.uid).await?;
            freed += bytes;
            used = used.saturating_sub(bytes);

            debug!(uid = %meta.uid, bytes, kind = %meta.cache_kind, "Evicted track");
            if let Some(bus) = &self.event_bus {
                bus.emit(CoreEvent::Offline(OfflineEvent::Evicted {
                    uid: meta.uid.clone(),
                    freed_bytes: bytes,
                    cache_kind: meta.cache_kind.to_string(),
                }))
                .ok();
            }
        }

        if freed > 0 {
            info!(freed_bytes = freed, used_bytes = used, target_bytes = target, "Eviction pass finished");
        }
        Ok((freed, used))
    }
}

#[async_trait]
impl CapacityGuard for Evictor {
    async fn make_room(&self, incoming_bytes: u64, uid: &str) -> Result<u64> {
        let _pass = self.pass.lock().await;
        let budget = self.budget_bytes().await?;

        if incoming_bytes > budget {
            return Err(OfflineError::QuotaExceeded(format!(
                "{} bytes exceed the cache budget of {} bytes",
                incoming_bytes, budget
            )));
        }

        // The incoming write replaces whatever the track already stores.
        let replaced = match self.store.get_meta(uid).await? {
            Some(meta) => meta.stored_size_bytes.unwrap_or(0),
            None => 0,
        };
        let used = self.store.total_bytes().await?.saturating_sub(replaced);
        let target = budget - incoming_bytes;

        let (freed, used_after) = self.evict_down_to(used, target, Some(uid)).await?;
        if used_after > target {
            return Err(OfflineError::QuotaExceeded(format!(
                "Only protected or pinned tracks remain; need {} more bytes",
                used_after - target
            )));
        }
        Ok(freed)
    }
}
