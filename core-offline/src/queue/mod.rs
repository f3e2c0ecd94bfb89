//! # Download Queue
//!
//! Priority queue of fetch-and-store tasks with a single audio slot.
//!
//! ## Overview
//!
//! Every track download, whether it is the track playing now, a pinned
//! track or a bulk full-offline download, goes through this queue:
//!
//! - At most one audio task runs at a time. Non-audio assets use a small
//!   separate pool.
//! - Tasks are ordered by [`Priority`] (P0 most urgent) and FIFO within a band.
//! - A task is identified by its [`TaskKey`]. Enqueuing a duplicate merges it
//!   and keeps the more urgent priority.
//! - Before the head is dispatched the [`DispatchGate`] is consulted. When it
//!   blocks, the queue parks and resumes on
//!   [`notify_conditions_changed`](DownloadQueue::notify_conditions_changed).
//! - A running audio task can be preempted by a more urgent band. It goes
//!   back into the queue without using a retry.
//! - Transient failures are retried with exponential backoff up to the
//!   configured limit.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = DownloadQueue::builder(http, store, clock)
//!     .gate(Arc::new(NetworkGate::new(policy, connectivity)))
//!     .config(OfflineConfig::default())
//!     .build();
//! let handle = queue.start();
//!
//! queue.enqueue(DownloadTask::audio("uid", Variant::Hi, url, Priority::P2, CacheKind::Pinned));
//! ```

mod gate;
mod pending;
mod profile;
mod task;
mod worker;

pub use gate::{CapacityGuard, DispatchGate, GateDecision, NetworkGate, OpenGate};
pub use pending::InsertOutcome;
pub use profile::BackgroundProfile;
pub use task::{DownloadTask, Priority, TaskId, TaskInfo, TaskKey, TaskTarget};

use bridge_traits::http::HttpClient;
use bridge_traits::time::Clock;
use core_runtime::config::PlatformClass;
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus, QueueEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};
use crate::store::CacheStore;
use pending::PendingSet;

/// Outcome of [`DownloadQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Merged into a waiting task with the same key.
    Merged,
    /// A task with the same key is already running.
    AlreadyActive,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
    pub paused: bool,
}

/// Why a running task was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortKind {
    Cancel,
    Preempt,
}

struct ActiveTask {
    task: DownloadTask,
    token: CancellationToken,
    abort: Arc<Mutex<Option<AbortKind>>>,
}

impl ActiveTask {
    fn abort(&self, kind: AbortKind) {
        *self.abort.lock() = Some(kind);
        self.token.cancel();
    }
}

#[derive(Default)]
struct QueueState {
    pending: PendingSet,
    active: HashMap<TaskKey, ActiveTask>,
    seq: u64,
    parked: Option<String>,
    cooldown_until: Option<Instant>,
}

impl QueueState {
    fn audio_busy(&self) -> bool {
        self.active.values().any(|active| active.task.is_audio())
    }

    fn active_assets(&self) -> usize {
        self.active.values().filter(|active| !active.task.is_audio()).count()
    }
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    http: Arc<dyn HttpClient>,
    store: Arc<dyn CacheStore>,
    gate: Arc<dyn DispatchGate>,
    capacity: Option<Arc<dyn CapacityGuard>>,
    clock: Arc<dyn Clock>,
    event_bus: Option<EventBus>,
    config: OfflineConfig,
    pause: Duration,
    shutdown: CancellationToken,
}

impl Shared {
    fn emit(&self, event: DownloadEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Download(event)).ok();
        }
    }

    fn emit_queue(&self, event: QueueEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Queue(event)).ok();
        }
    }

    /// Start whatever may run now. Returns the instant the dispatcher should
    /// look again if nothing else wakes it.
    fn dispatch_ready(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(until) = state.cooldown_until {
            if until > now {
                return Some(until);
            }
            state.cooldown_until = None;
        }

        let mut wake_at = None;

        if !state.audio_busy() {
            match state.pending.peek_ready(now, true).cloned() {
                Some(task) => {
                    if !self.admit(&mut state, &task) {
                        return None;
                    }
                    self.launch(&mut state, task);
                }
                None => wake_at = state.pending.next_ready_at(true),
            }
        }

        while state.active_assets() < self.config.asset_concurrency {
            let Some(task) = state.pending.peek_ready(now, false).cloned() else {
                wake_at = earliest(wake_at, state.pending.next_ready_at(false));
                break;
            };
            if !self.admit(&mut state, &task) {
                return None;
            }
            self.launch(&mut state, task);
        }

        wake_at
    }

    /// Apply the gate to the head. Parks on refusal, resumes on admission.
    fn admit(&self, state: &mut QueueState, task: &DownloadTask) -> bool {
        match self.gate.admit(task) {
            GateDecision::Admit => {
                if state.parked.take().is_some() {
                    info!(queued = state.pending.len(), "Download queue resumed");
                    self.emit_queue(QueueEvent::Resumed {
                        queued: state.pending.len(),
                    });
                }
                true
            }
            GateDecision::Blocked(reason) => {
                if state.parked.is_none() {
                    info!(reason = %reason, queued = state.pending.len(), "Download queue parked");
                    self.emit_queue(QueueEvent::Parked {
                        reason: reason.clone(),
                        queued: state.pending.len(),
                    });
                    state.parked = Some(reason);
                }
                false
            }
        }
    }

    fn launch(self: &Arc<Self>, state: &mut QueueState, task: DownloadTask) {
        let key = task.key();
        let Some(task) = state.pending.take(&key) else {
            return;
        };

        debug!(uid = %task.uid, priority = %task.priority, attempt = task.retries + 1, "Dispatching task");

        let token = self.shutdown.child_token();
        let abort = Arc::new(Mutex::new(None));
        state.active.insert(
            key,
            ActiveTask {
                task: task.clone(),
                token: token.clone(),
                abort: Arc::clone(&abort),
            },
        );

        tokio::spawn(worker::execute(Arc::clone(self), task, token, abort));
    }

    /// Settle a finished task and wake the dispatcher.
    fn finish(
        &self,
        task: DownloadTask,
        result: Result<u64>,
        abort: Option<AbortKind>,
        elapsed: Duration,
    ) {
        let key = task.key();
        let mut state = self.state.lock();

        // The registry copy carries any priority upgrade made while running.
        let mut task = state
            .active
            .remove(&key)
            .map(|active| active.task)
            .unwrap_or(task);

        match result {
            Ok(size_bytes) => {
                info!(uid = %task.uid, size_bytes, "Download completed");
                self.emit(DownloadEvent::Completed {
                    task_id: task.id.to_string(),
                    uid: task.uid.clone(),
                    variant: task.variant_label(),
                    size_bytes,
                    duration_ms: elapsed.as_millis() as u64,
                });
                state.cooldown_until = Some(Instant::now() + self.pause);
            }
            Err(OfflineError::Cancelled) if abort == Some(AbortKind::Cancel) => {
                debug!(uid = %task.uid, "Download cancelled");
                self.emit(DownloadEvent::Cancelled {
                    task_id: task.id.to_string(),
                    uid: task.uid.clone(),
                });
            }
            Err(OfflineError::Cancelled) => {
                // Preempted, or the queue is shutting down: back in line as is.
                debug!(uid = %task.uid, priority = %task.priority, "Download preempted");
                state.pending.insert(task, None);
            }
            Err(e) if e.is_transient() && task.retries < self.config.max_retries => {
                let delay = self.config.backoff_for(task.retries);
                task.retries += 1;
                warn!(
                    uid = %task.uid,
                    retries = task.retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Download failed, retrying"
                );
                self.emit(DownloadEvent::Retrying {
                    task_id: task.id.to_string(),
                    uid: task.uid.clone(),
                    retries: task.retries,
                    delay_ms: delay.as_millis() as u64,
                    message: e.to_string(),
                });
                state.pending.insert(task, Some(Instant::now() + delay));
                state.cooldown_until = Some(Instant::now() + self.pause);
            }
            Err(e) => {
                let message = match &e {
                    OfflineError::QuotaExceeded(reason) => format!("Cache full: {}", reason),
                    other => other.to_string(),
                };
                warn!(uid = %task.uid, error = %message, "Download failed");
                self.emit(DownloadEvent::Failed {
                    task_id: task.id.to_string(),
                    uid: task.uid.clone(),
                    message,
                    retries: task.retries,
                });
                state.cooldown_until = Some(Instant::now() + self.pause);
            }
        }

        drop(state);
        self.wake.notify_one();
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Handle to the download queue. Cheap to clone.
#[derive(Clone)]
pub struct DownloadQueue {
    shared: Arc<Shared>,
}

impl DownloadQueue {
    pub fn builder(
        http: Arc<dyn HttpClient>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> DownloadQueueBuilder {
        DownloadQueueBuilder::new(http, store, clock)
    }

    /// Spawn the dispatcher. It runs until [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            info!(pause_ms = shared.pause.as_millis() as u64, "Download queue started");
            loop {
                let wake_at = shared.dispatch_ready();
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                    _ = sleep_until(wake_at) => {}
                }
            }
            info!("Download queue stopped");
        })
    }

    /// Stop dispatching and abort running tasks. Aborted tasks stay queued.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn enqueue(&self, mut task: DownloadTask) -> EnqueueOutcome {
        let key = task.key();
        let mut state = self.shared.state.lock();

        if let Some(active) = state.active.get_mut(&key) {
            if task.priority < active.task.priority {
                active.task.priority = task.priority;
            }
            return EnqueueOutcome::AlreadyActive;
        }

        state.seq += 1;
        task.seq = state.seq;
        task.added_at = self.shared.clock.unix_timestamp_millis();

        let queued = DownloadEvent::Queued {
            task_id: task.id.to_string(),
            uid: task.uid.clone(),
            variant: task.variant_label(),
            priority: task.priority.as_u8(),
            cache_kind: task.kind_label(),
        };
        let outcome = state.pending.insert(task, None);
        drop(state);

        let outcome = match outcome {
            InsertOutcome::Added => {
                self.shared.emit(queued);
                EnqueueOutcome::Queued
            }
            InsertOutcome::Merged => EnqueueOutcome::Merged,
        };
        self.shared.wake.notify_one();
        outcome
    }

    /// Remove every queued task for `uid` and abort the running one.
    pub fn cancel(&self, uid: &str) -> usize {
        let mut state = self.shared.state.lock();

        let removed = state.pending.remove_uid(uid);
        for task in &removed {
            self.shared.emit(DownloadEvent::Cancelled {
                task_id: task.id.to_string(),
                uid: task.uid.clone(),
            });
        }

        let mut aborted = 0;
        for active in state.active.values().filter(|active| active.task.uid == uid) {
            active.abort(AbortKind::Cancel);
            aborted += 1;
        }
        drop(state);

        if removed.len() + aborted > 0 {
            debug!(uid, queued = removed.len(), running = aborted, "Cancelled downloads");
        }
        self.shared.wake.notify_one();
        removed.len() + aborted
    }

    pub fn cancel_all(&self) -> usize {
        let mut state = self.shared.state.lock();

        let removed = state.pending.drain();
        for task in &removed {
            self.shared.emit(DownloadEvent::Cancelled {
                task_id: task.id.to_string(),
                uid: task.uid.clone(),
            });
        }
        for active in state.active.values() {
            active.abort(AbortKind::Cancel);
        }
        let total = removed.len() + state.active.len();
        drop(state);

        info!(count = total, "Cancelled all downloads");
        self.shared.wake.notify_one();
        total
    }

    /// Abort the running audio task if it is less urgent than `priority`.
    pub fn preempt(&self, priority: Priority) -> bool {
        let state = self.shared.state.lock();
        let victim = state
            .active
            .values()
            .find(|active| active.task.is_audio() && active.task.priority > priority);

        match victim {
            Some(active) => {
                debug!(
                    uid = %active.task.uid,
                    running = %active.task.priority,
                    incoming = %priority,
                    "Preempting download"
                );
                active.abort(AbortKind::Preempt);
                true
            }
            None => false,
        }
    }

    /// Re-run the gate, for example after a network or policy change.
    pub fn notify_conditions_changed(&self) {
        self.shared.wake.notify_one();
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        QueueStatus {
            active: state.active.len(),
            queued: state.pending.len(),
            paused: state.parked.is_some(),
        }
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        let state = self.shared.state.lock();
        state.active.contains_key(key) || state.pending.contains(key)
    }

    /// Running tasks first, then queued tasks in dispatch order.
    pub fn snapshot(&self) -> Vec<TaskInfo> {
        let state = self.shared.state.lock();
        let mut active: Vec<&ActiveTask> = state.active.values().collect();
        active.sort_by_key(|active| active.task.order());

        active
            .into_iter()
            .map(|active| TaskInfo::from_task(&active.task, true))
            .chain(
                state
                    .pending
                    .ordered()
                    .into_iter()
                    .map(|task| TaskInfo::from_task(task, false)),
            )
            .collect()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Builder for [`DownloadQueue`].
pub struct DownloadQueueBuilder {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    gate: Arc<dyn DispatchGate>,
    capacity: Option<Arc<dyn CapacityGuard>>,
    event_bus: Option<EventBus>,
    config: OfflineConfig,
    platform: PlatformClass,
    shutdown: Option<CancellationToken>,
}

impl DownloadQueueBuilder {
    fn new(http: Arc<dyn HttpClient>, store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            store,
            clock,
            gate: Arc::new(OpenGate),
            capacity: None,
            event_bus: None,
            config: OfflineConfig::default(),
            platform: PlatformClass::default(),
            shutdown: None,
        }
    }

    pub fn gate(mut self, gate: Arc<dyn DispatchGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn capacity_guard(mut self, guard: Arc<dyn CapacityGuard>) -> Self {
        self.capacity = Some(guard);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(mut self, config: OfflineConfig) -> Self {
        self.config = config;
        self
    }

    /// Picks the background profile when the config does not set one.
    pub fn platform(mut self, platform: PlatformClass) -> Self {
        self.platform = platform;
        self
    }

    /// Tie the queue to an outer shutdown token.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> DownloadQueue {
        let profile = self
            .config
            .background_profile
            .unwrap_or_else(|| BackgroundProfile::for_platform(self.platform));

        DownloadQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                http: self.http,
                store: self.store,
                gate: self.gate,
                capacity: self.capacity,
                clock: self.clock,
                event_bus: self.event_bus,
                pause: profile.pause(),
                config: self.config,
                shutdown: self.shutdown.unwrap_or_default(),
            }),
        }
    }
}
