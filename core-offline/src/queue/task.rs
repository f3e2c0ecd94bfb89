//! Download task model

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::{CacheKind, Variant};

/// Priority band. Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    /// Track that is playing now.
    P0 = 0,
    /// Neighbor in the direction of travel.
    P1 = 1,
    /// Pinned track.
    P2 = 2,
    /// Needs-update or re-cache.
    P3 = 3,
    /// Cloud auto-fill.
    P4 = 4,
    /// Non-audio asset.
    P5 = 5,
    /// Bulk full-offline download.
    P6 = 6,
}

impl Priority {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.as_u8())
    }
}

/// Type-safe task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task fetches and where the bytes go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTarget {
    /// Audio for `uid` at `variant`.
    Audio { variant: Variant, url: String },
    /// Non-audio asset stored under `key`.
    Asset { key: String, url: String },
}

impl TaskTarget {
    pub fn url(&self) -> &str {
        match self {
            TaskTarget::Audio { url, .. } | TaskTarget::Asset { url, .. } => url,
        }
    }
}

/// Deduplication key. At most one task per key is queued or running.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub uid: String,
    pub variant: Option<Variant>,
    pub cache_kind: CacheKind,
}

impl TaskKey {
    pub fn audio(uid: impl Into<String>, variant: Variant, cache_kind: CacheKind) -> Self {
        Self {
            uid: uid.into(),
            variant: Some(variant),
            cache_kind,
        }
    }

    pub fn asset(key: impl Into<String>) -> Self {
        Self {
            uid: key.into(),
            variant: None,
            cache_kind: CacheKind::None,
        }
    }
}

/// A unit of fetch-and-store work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: TaskId,
    /// Track uid, or the asset key for asset tasks.
    pub uid: String,
    pub target: TaskTarget,
    pub priority: Priority,
    pub cache_kind: CacheKind,
    /// Retries used so far.
    pub retries: u32,
    /// Unix epoch millis when first enqueued.
    pub added_at: i64,
    /// Enqueue sequence, assigned by the queue. Breaks priority ties.
    pub seq: u64,
}

impl DownloadTask {
    pub fn audio(
        uid: impl Into<String>,
        variant: Variant,
        url: impl Into<String>,
        priority: Priority,
        cache_kind: CacheKind,
    ) -> Self {
        Self {
            id: TaskId::new(),
            uid: uid.into(),
            target: TaskTarget::Audio {
                variant,
                url: url.into(),
            },
            priority,
            cache_kind,
            retries: 0,
            added_at: 0,
            seq: 0,
        }
    }

    /// Asset tasks always run at P5.
    pub fn asset(key: impl Into<String>, url: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id: TaskId::new(),
            uid: key.clone(),
            target: TaskTarget::Asset {
                key,
                url: url.into(),
            },
            priority: Priority::P5,
            cache_kind: CacheKind::None,
            retries: 0,
            added_at: 0,
            seq: 0,
        }
    }

    pub fn key(&self) -> TaskKey {
        match &self.target {
            TaskTarget::Audio { variant, .. } => {
                TaskKey::audio(self.uid.clone(), *variant, self.cache_kind)
            }
            TaskTarget::Asset { key, .. } => TaskKey::asset(key.clone()),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.target, TaskTarget::Audio { .. })
    }

    pub fn variant(&self) -> Option<Variant> {
        match &self.target {
            TaskTarget::Audio { variant, .. } => Some(*variant),
            TaskTarget::Asset { .. } => None,
        }
    }

    /// Label used in events: the variant, or empty for assets.
    pub fn variant_label(&self) -> String {
        self.variant().map(|v| v.to_string()).unwrap_or_default()
    }

    /// Label used in events: the cache kind, or "asset".
    pub fn kind_label(&self) -> String {
        if self.is_audio() {
            self.cache_kind.to_string()
        } else {
            "asset".to_string()
        }
    }

    /// Dispatch order: priority, then enqueue sequence.
    pub fn order(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }
}

/// Read-only view of a queued or running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub uid: String,
    pub variant: Option<Variant>,
    pub priority: Priority,
    pub cache_kind: CacheKind,
    pub retries: u32,
    pub active: bool,
}

impl TaskInfo {
    pub fn from_task(task: &DownloadTask, active: bool) -> Self {
        Self {
            task_id: task.id.to_string(),
            uid: task.uid.clone(),
            variant: task.variant(),
            priority: task.priority,
            cache_kind: task.cache_kind,
            retries: task.retries,
            active,
        }
    }
}
