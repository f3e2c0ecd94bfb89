//! # Playback Window
//!
//! Keeps the track that is playing and the one the listener is about to
//! reach warm in the cache.
//!
//! The window is the cyclic triple `{prev, current, next}` around the playlist
//! index. The transport reports the direction of travel explicitly; only the
//! neighbor in that direction is fetched ahead. All three slots are shielded
//! from eviction while they are in the window.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::catalog::TrackCatalog;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::model::CacheKind;
use crate::policy::PolicyStore;
use crate::queue::{DownloadQueue, DownloadTask, Priority};
use crate::store::CacheStore;

/// Direction of travel through the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// The three uids around the current index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSlots {
    pub prev: String,
    pub current: String,
    pub next: String,
}

impl WindowSlots {
    /// Cyclic window around `index`. `None` for an empty playlist or an
    /// index outside it.
    pub fn compute(playlist: &[String], index: usize) -> Option<Self> {
        let len = playlist.len();
        if index >= len {
            return None;
        }
        Some(Self {
            prev: playlist[(index + len - 1) % len].clone(),
            current: playlist[index].clone(),
            next: playlist[(index + 1) % len].clone(),
        })
    }

    /// Neighbor the listener reaches next.
    pub fn ahead(&self, direction: Direction) -> &str {
        match direction {
            Direction::Forward => &self.next,
            Direction::Backward => &self.prev,
        }
    }

    pub fn uids(&self) -> [&str; 3] {
        [&self.prev, &self.current, &self.next]
    }
}

/// Uids that eviction must not touch. Shared between the window and the
/// evictor.
#[derive(Debug, Clone, Default)]
pub struct ProtectedSet(Arc<RwLock<HashSet<String>>>);

impl ProtectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.0.read().contains(uid)
    }

    pub fn replace<I>(&self, uids: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut set = self.0.write();
        set.clear();
        set.extend(uids.into_iter().map(Into::into));
    }

    pub fn clear(&self) {
        self.0.write().clear();
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.read().iter().cloned().collect()
    }
}

/// Client of the queue that follows the transport.
pub struct PlaybackWindow {
    queue: DownloadQueue,
    store: Arc<dyn CacheStore>,
    policy: Arc<PolicyStore>,
    catalog: Arc<dyn TrackCatalog>,
    connectivity: Connectivity,
    protected: ProtectedSet,
}

impl PlaybackWindow {
    pub fn new(
        queue: DownloadQueue,
        store: Arc<dyn CacheStore>,
        policy: Arc<PolicyStore>,
        catalog: Arc<dyn TrackCatalog>,
        connectivity: Connectivity,
        protected: ProtectedSet,
    ) -> Self {
        Self {
            queue,
            store,
            policy,
            catalog,
            connectivity,
            protected,
        }
    }

    pub fn protected(&self) -> &ProtectedSet {
        &self.protected
    }

    /// Recompute the window and schedule the current track and the neighbor
    /// ahead. Returns the new window.
    #[instrument(skip(self, playlist), fields(len = playlist.len()))]
    pub async fn on_track_change(
        &self,
        playlist: &[String],
        index: usize,
        direction: Direction,
    ) -> Result<Option<WindowSlots>> {
        let Some(slots) = WindowSlots::compute(playlist, index) else {
            self.protected.clear();
            return Ok(None);
        };
        self.protected.replace(slots.uids());

        let mode = self.policy.mode();
        let class = self.connectivity.current();
        if !mode.caches_window() || !self.policy.network_allowed(class) {
            debug!(mode = %mode, connection = class.as_str(), "Window caching inactive");
            return Ok(Some(slots));
        }

        if self.schedule(&slots.current, Priority::P0).await? {
            self.queue.preempt(Priority::P0);
        }

        let ahead = slots.ahead(direction);
        if ahead != slots.current {
            self.schedule(ahead, Priority::P1).await?;
        }

        Ok(Some(slots))
    }

    /// Playback stopped: nothing is protected any more.
    pub fn on_stop(&self) {
        self.protected.clear();
    }

    /// Enqueue a transient copy at the active quality, raising the priority of
    /// a task already waiting. Returns whether a task is now waiting or running
    /// for `uid`.
    async fn schedule(&self, uid: &str, priority: Priority) -> Result<bool> {
        let quality = self.policy.active_playback_quality();

        if let Some(meta) = self.store.get_meta(uid).await? {
            if meta.is_complete_at(quality) {
                return Ok(false);
            }
        }

        let Some(entry) = self.catalog.entry(uid).await? else {
            debug!(uid, "Track not in catalog, skipping window fetch");
            return Ok(false);
        };
        let Some(url) = entry.url_for(quality) else {
            debug!(uid, quality = %quality, "No remote URL for window fetch");
            return Ok(false);
        };

        let task = DownloadTask::audio(uid, quality, url, priority, CacheKind::Transient);
        self.queue.enqueue(task);
        Ok(true)
    }
}
