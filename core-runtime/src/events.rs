//! # Event Bus System
//!
//! Typed events published by the offline cache engine using `tokio::sync::broadcast`.
//! The UI and the host player subscribe here instead of being called back directly.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for each engine component
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   emit    ┌───────────┐
//! │ Download Queue ├──────────>│           │
//! └────────────────┘           │           │
//!                              │ EventBus  │
//! ┌────────────────┐   emit    │ (broadcast│   subscribe   ┌────────────┐
//! │Offline Manager ├──────────>│  channel) ├──────────────>│  UI layer  │
//! └────────────────┘           │           │               └────────────┘
//!                              │           │
//! ┌────────────────┐   emit    │           │   subscribe   ┌────────────┐
//! │ Policy / Stats ├──────────>│           ├──────────────>│ Host logs  │
//! └────────────────┘           └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust
//! use core_runtime::events::{EventBus, CoreEvent, OfflineEvent};
//!
//! let event_bus = EventBus::new(100);
//! let event = CoreEvent::Offline(OfflineEvent::CloudPromoted {
//!     uid: "track-1".to_string(),
//!     full_listen_count: 3,
//!     expires_at: 1_700_000_000,
//! });
//!
//! event_bus.emit(event).ok();
//! ```
//!
//! ### Subscribing to Events
//!
//! ```rust
//! use core_runtime::events::{EventBus, CoreEvent};
//! use tokio::sync::broadcast::error::RecvError;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! tokio::spawn(async move {
//!     loop {
//!         match stream.recv().await {
//!             Ok(event) => println!("Received: {:?}", event),
//!             Err(RecvError::Lagged(n)) => {
//!                 eprintln!("Missed {} events", n);
//!             }
//!             Err(RecvError::Closed) => break,
//!         }
//!     }
//! });
//! # }
//! ```
//!
//! ## Event Types
//!
//! ### Download Events
//! - `Queued`, `Started`, `Progress`, `Retrying`, `Completed`, `Failed`, `Cancelled`
//!
//! ### Queue Events
//! - `Parked`: dispatch blocked by network policy or connectivity
//! - `Resumed`: conditions changed and dispatch continues
//!
//! ### Offline Events
//! - `CloudPromoted`, `CloudExpired`, `Evicted`, `NeedsUpdate`,
//!   `OfflineStateChanged`, `CacheCleared`
//!
//! ### Policy Events
//! - `ModeChanged`, `ModeRefused`, `Changed`
//!
//! ### Stats Events
//! - `FullListen`
//!
//! ## Error Handling
//!
//! The event bus uses `tokio::sync::broadcast`, which can produce two types of errors:
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Progress events are frequent. Subscribers that only care about terminal
//! outcomes should filter them out with [`EventStream::filter`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Download task lifecycle
    Download(DownloadEvent),
    /// Queue-wide dispatch state
    Queue(QueueEvent),
    /// Pinned/cloud lifecycle, eviction and staleness
    Offline(OfflineEvent),
    /// Mode and preference changes
    Policy(PolicyEvent),
    /// Listening statistics
    Stats(StatsEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Queue(e) => e.description(),
            CoreEvent::Offline(e) => e.description(),
            CoreEvent::Policy(e) => e.description(),
            CoreEvent::Stats(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Download(DownloadEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Policy(PolicyEvent::ModeRefused { .. }) => EventSeverity::Warning,
            CoreEvent::Offline(OfflineEvent::NeedsUpdate { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Retrying { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Offline(OfflineEvent::CloudPromoted { .. }) => EventSeverity::Info,
            CoreEvent::Offline(OfflineEvent::CloudExpired { .. }) => EventSeverity::Info,
            CoreEvent::Offline(OfflineEvent::Evicted { .. }) => EventSeverity::Info,
            CoreEvent::Offline(OfflineEvent::CacheCleared { .. }) => EventSeverity::Info,
            CoreEvent::Policy(PolicyEvent::ModeChanged { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Download Events
// ============================================================================

/// Events emitted by the download queue for individual tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// Task accepted (or merged into an existing one).
    Queued {
        task_id: String,
        uid: String,
        /// "lo" or "hi"; empty for asset tasks.
        variant: String,
        /// Priority band, 0 is most urgent.
        priority: u8,
        /// "pinned", "cloud", "transient" or "asset".
        cache_kind: String,
    },
    /// Task took the execution slot.
    Started {
        task_id: String,
        uid: String,
        variant: String,
        priority: u8,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Incremental progress of a streamed fetch.
    Progress {
        task_id: String,
        uid: String,
        bytes_downloaded: u64,
        /// Declared size when the server sent one.
        total_bytes: Option<u64>,
        /// Progress percentage (0-100), 0 while the size is unknown.
        percent: u8,
    },
    /// Attempt failed and the task was re-queued with backoff.
    Retrying {
        task_id: String,
        uid: String,
        /// Retries used so far.
        retries: u32,
        delay_ms: u64,
        message: String,
    },
    /// Blob persisted and metadata updated.
    Completed {
        task_id: String,
        uid: String,
        variant: String,
        size_bytes: u64,
        duration_ms: u64,
    },
    /// Terminal failure; the task was dropped.
    Failed {
        task_id: String,
        uid: String,
        /// Human-readable error message.
        message: String,
        retries: u32,
    },
    /// Task removed by an explicit cancel.
    Cancelled { task_id: String, uid: String },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Queued { .. } => "Download queued",
            DownloadEvent::Started { .. } => "Download started",
            DownloadEvent::Progress { .. } => "Download in progress",
            DownloadEvent::Retrying { .. } => "Download retry scheduled",
            DownloadEvent::Completed { .. } => "Download completed",
            DownloadEvent::Failed { .. } => "Download failed",
            DownloadEvent::Cancelled { .. } => "Download cancelled",
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

/// Queue-wide dispatch state changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// Dispatch stopped because the network gate is closed. Nothing is dropped.
    Parked {
        reason: String,
        /// Tasks waiting when the queue parked.
        queued: usize,
    },
    /// Dispatch resumed after a connectivity or policy change.
    Resumed { queued: usize },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::Parked { .. } => "Download queue parked",
            QueueEvent::Resumed { .. } => "Download queue resumed",
        }
    }
}

// ============================================================================
// Offline Events
// ============================================================================

/// Lifecycle of locally cached tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum OfflineEvent {
    /// Track became a cloud copy after repeated full listens.
    CloudPromoted {
        uid: String,
        full_listen_count: u32,
        /// Expiry (Unix epoch seconds).
        expires_at: i64,
    },
    /// User-visible offline state of a track changed.
    OfflineStateChanged {
        uid: String,
        pinned: bool,
        cloud: bool,
        cached_complete: u8,
        needs_update: bool,
    },
    /// Expired cloud copy removed by the sweep.
    CloudExpired { uid: String, freed_bytes: u64 },
    /// Track removed to stay under the cache limit.
    Evicted {
        uid: String,
        freed_bytes: u64,
        /// "transient" or "cloud".
        cache_kind: String,
    },
    /// Declared remote size no longer matches the stored copy.
    NeedsUpdate {
        uid: String,
        declared_bytes: u64,
        stored_bytes: u64,
    },
    /// Every cached blob, meta and asset was removed.
    CacheCleared { freed_bytes: u64, tracks: usize },
}

impl OfflineEvent {
    fn description(&self) -> &str {
        match self {
            OfflineEvent::CloudPromoted { .. } => "Track promoted to cloud",
            OfflineEvent::OfflineStateChanged { .. } => "Track offline state changed",
            OfflineEvent::CloudExpired { .. } => "Cloud copy expired",
            OfflineEvent::Evicted { .. } => "Track evicted from cache",
            OfflineEvent::NeedsUpdate { .. } => "Cached track changed remotely",
            OfflineEvent::CacheCleared { .. } => "Cache cleared",
        }
    }
}

// ============================================================================
// Policy Events
// ============================================================================

/// Mode and preference changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PolicyEvent {
    /// Operating mode switched.
    ModeChanged { from: String, to: String },
    /// Mode transition rejected; the mode is unchanged.
    ModeRefused {
        current: String,
        requested: String,
        /// User-facing reason.
        reason: String,
    },
    /// Any persisted policy field changed.
    Changed { mode: String },
}

impl PolicyEvent {
    fn description(&self) -> &str {
        match self {
            PolicyEvent::ModeChanged { .. } => "Mode changed",
            PolicyEvent::ModeRefused { .. } => "Mode change refused",
            PolicyEvent::Changed { .. } => "Policy updated",
        }
    }
}

// ============================================================================
// Stats Events
// ============================================================================

/// Listening statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum StatsEvent {
    /// Play-through reached the full-listen threshold.
    FullListen {
        uid: String,
        global_full_listen_count: u64,
        cloud_full_listen_count: u32,
    },
}

impl StatsEvent {
    fn description(&self) -> &str {
        match self {
            StatsEvent::FullListen { .. } => "Full listen recorded",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning is cheap; every clone publishes into the same channel. Sends never
/// block, and a subscriber that falls more than `capacity` events behind gets
/// `RecvError::Lagged` and continues from the oldest retained event.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Bus with [`DEFAULT_EVENT_BUFFER_SIZE`].
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publish to every current subscriber. Errors when nobody listens,
    /// which publishers ignore with `.ok()`.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Independent receiver for events emitted from now on.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with additional filtering capabilities.
///
/// This provides a more ergonomic API for consuming events with optional filtering
/// by event type or severity.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, EventStream, CoreEvent, DownloadEvent};
///
/// # #[tokio::main]
/// # async fn main() {
/// let event_bus = EventBus::new(100);
/// let stream = EventStream::new(event_bus.subscribe());
///
/// // Skip progress chatter
/// let _outcomes = stream.filter(|event| {
///     !matches!(event, CoreEvent::Download(DownloadEvent::Progress { .. }))
/// });
/// # }
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    ///
    /// Only events that match the filter will be returned by `recv()`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::{EventBus, EventStream, CoreEvent, DownloadEvent};
    ///
    /// let event_bus = EventBus::new(100);
    /// let stream = EventStream::new(event_bus.subscribe());
    ///
    /// let _outcomes = stream.filter(|event| {
    ///     !matches!(event, CoreEvent::Download(DownloadEvent::Progress { .. }))
    /// });
    /// ```
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Next event accepted by the filter.
    ///
    /// # Errors
    ///
    /// `RecvError::Lagged(n)` if the subscriber fell behind by `n` events,
    /// `RecvError::Closed` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing
    /// accepted is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}


// ============================================================================
// Tests
// ============================================================================
