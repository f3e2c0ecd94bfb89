//! Ordered set of tasks waiting for a slot.

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

use super::task::{DownloadTask, Priority, TaskKey};

/// Result of inserting into the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// Same key already waiting; the more urgent priority was kept.
    Merged,
}

#[derive(Debug)]
struct Entry {
    task: DownloadTask,
    /// Backoff: not dispatchable before this instant.
    ready_at: Option<Instant>,
}

/// Tasks keyed by [`TaskKey`] and ordered by `(priority, seq)`.
#[derive(Debug, Default)]
pub(crate) struct PendingSet {
    order: BTreeMap<(Priority, u64), TaskKey>,
    entries: HashMap<TaskKey, Entry>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: DownloadTask, ready_at: Option<Instant>) -> InsertOutcome {
        let key = task.key();

        if let Some(existing) = self.entries.get_mut(&key) {
            if task.priority < existing.task.priority {
                self.order.remove(&existing.task.order());
                existing.task.priority = task.priority;
                self.order.insert(existing.task.order(), key);
            }
            return InsertOutcome::Merged;
        }

        self.order.insert(task.order(), key.clone());
        self.entries.insert(key, Entry { task, ready_at });
        InsertOutcome::Added
    }

    /// Most urgent task of the given kind that may run at `now`.
    pub fn peek_ready(&self, now: Instant, audio: bool) -> Option<&DownloadTask> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .filter(|entry| entry.task.is_audio() == audio)
            .find(|entry| entry.ready_at.map_or(true, |at| at <= now))
            .map(|entry| &entry.task)
    }

    /// Earliest instant a backed-off task of the given kind becomes ready.
    pub fn next_ready_at(&self, audio: bool) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| entry.task.is_audio() == audio)
            .filter_map(|entry| entry.ready_at)
            .min()
    }

    pub fn take(&mut self, key: &TaskKey) -> Option<DownloadTask> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.task.order());
        Some(entry.task)
    }

    pub fn remove_uid(&mut self, uid: &str) -> Vec<DownloadTask> {
        let keys: Vec<TaskKey> = self
            .entries
            .keys()
            .filter(|key| key.uid == uid)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.take(key)).collect()
    }

    pub fn drain(&mut self) -> Vec<DownloadTask> {
        self.order.clear();
        self.entries.drain().map(|(_, entry)| entry.task).collect()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tasks in dispatch order.
    pub fn ordered(&self) -> Vec<&DownloadTask> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.task)
            .collect()
    }
}
