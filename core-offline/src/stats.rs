//! # Stats Core
//!
//! Listening time and full-listen detection for the track that is playing.
//!
//! A play-through starts with [`StatsCore::on_track_start`]. While it is
//! playing, the one-second ticker adds to the never-reset
//! `global_listen_seconds` and advances the playback position. Seeking only
//! moves the position; the furthest position ever reached decides whether
//! the play-through counts as a full listen (at least 90 % of the duration).
//! A full listen is recorded once per play-through and forwarded to the
//! offline manager as a [`FullListenSignal`].

use core_runtime::events::{CoreEvent, EventBus, StatsEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::store::CacheStore;

/// Share of the duration that must be reached for a full listen.
pub const FULL_LISTEN_THRESHOLD: f64 = 0.9;

/// A play-through reached the full-listen threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullListenSignal {
    pub uid: String,
    pub global_full_listen_count: u64,
    pub cloud_full_listen_count: u32,
}

#[derive(Debug)]
struct PlayThrough {
    uid: String,
    duration_secs: f64,
    position_secs: f64,
    furthest_secs: f64,
    playing: bool,
    full_listen_recorded: bool,
}

impl PlayThrough {
    fn reached_threshold(&self) -> bool {
        self.duration_secs > 0.0
            && self.furthest_secs >= self.duration_secs * FULL_LISTEN_THRESHOLD
    }

    fn advance_to(&mut self, position_secs: f64) {
        self.position_secs = position_secs.clamp(0.0, self.duration_secs.max(0.0));
        self.furthest_secs = self.furthest_secs.max(self.position_secs);
    }

    /// Returns the uid when this update crossed the threshold for the first time.
    fn take_full_listen(&mut self) -> Option<String> {
        if !self.full_listen_recorded && self.reached_threshold() {
            self.full_listen_recorded = true;
            Some(self.uid.clone())
        } else {
            None
        }
    }
}

/// Per-track timer and full-listen detector.
pub struct StatsCore {
    store: Arc<dyn CacheStore>,
    current: Mutex<Option<PlayThrough>>,
    signals: mpsc::UnboundedSender<FullListenSignal>,
    event_bus: Option<EventBus>,
}

impl StatsCore {
    /// Create the stats core and the receiving end of its promotion signals.
    pub fn new(store: Arc<dyn CacheStore>) -> (Self, mpsc::UnboundedReceiver<FullListenSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                current: Mutex::new(None),
                signals: tx,
                event_bus: None,
            },
            rx,
        )
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Begin a new play-through. Any previous one is abandoned.
    pub fn on_track_start(&self, uid: &str, duration: Duration) {
        debug!(uid, duration_secs = duration.as_secs_f64(), "Play-through started");
        *self.current.lock() = Some(PlayThrough {
            uid: uid.to_string(),
            duration_secs: duration.as_secs_f64(),
            position_secs: 0.0,
            furthest_secs: 0.0,
            playing: true,
            full_listen_recorded: false,
        });
    }

    pub fn on_pause(&self) {
        if let Some(play) = self.current.lock().as_mut() {
            play.playing = false;
        }
    }

    pub fn on_resume(&self) {
        if let Some(play) = self.current.lock().as_mut() {
            play.playing = true;
        }
    }

    /// Move the playback position. Reaching the threshold this way counts.
    pub async fn on_seek(&self, position: Duration) -> Result<()> {
        let crossed = self.with_current(|play| {
            play.advance_to(position.as_secs_f64());
            play.take_full_listen()
        });
        self.record_if_crossed(crossed).await
    }

    /// Natural end of the track.
    pub async fn on_end(&self) -> Result<()> {
        let crossed = self.finish(|play| play.duration_secs);
        self.record_if_crossed(crossed).await
    }

    /// User skipped away at `position`.
    pub async fn on_skip(&self, position: Duration) -> Result<()> {
        let position_secs = position.as_secs_f64();
        let crossed = self.finish(|_| position_secs);
        self.record_if_crossed(crossed).await
    }

    /// One second of playback.
    pub async fn tick(&self) -> Result<()> {
        let ticked = {
            let mut current = self.current.lock();
            match current.as_mut() {
                Some(play) if play.playing => {
                    let next = play.position_secs + 1.0;
                    play.advance_to(next);
                    Some((play.uid.clone(), play.take_full_listen()))
                }
                _ => None,
            }
        };

        let Some((uid, crossed)) = ticked else {
            return Ok(());
        };

        self.store.add_listen_seconds(&uid, 1).await?;
        self.record_if_crossed(crossed).await
    }

    /// Uid of the current play-through, if any.
    pub fn current_uid(&self) -> Option<String> {
        self.current.lock().as_ref().map(|play| play.uid.clone())
    }

    /// Run [`tick`](Self::tick) every second until `shutdown` fires.
    pub fn spawn_ticker(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "Failed to record listening time");
                        }
                    }
                }
            }
            debug!("Stats ticker stopped");
        })
    }

    fn with_current<F>(&self, f: F) -> Option<String>
    where
        F: FnOnce(&mut PlayThrough) -> Option<String>,
    {
        self.current.lock().as_mut().and_then(f)
    }

    /// Advance to a final position and close the play-through.
    fn finish<F>(&self, final_position: F) -> Option<String>
    where
        F: FnOnce(&PlayThrough) -> f64,
    {
        let mut current = self.current.lock();
        let mut play = current.take()?;
        let position = final_position(&play);
        play.advance_to(position);
        play.playing = false;
        play.take_full_listen()
    }

    #[instrument(skip(self))]
    async fn record_if_crossed(&self, crossed: Option<String>) -> Result<()> {
        let Some(uid) = crossed else {
            return Ok(());
        };

        let (stat, cloud_count) = self.store.record_full_listen(&uid).await?;
        info!(
            uid = %uid,
            global_full_listen_count = stat.global_full_listen_count,
            cloud_full_listen_count = cloud_count,
            "Full listen recorded"
        );

        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Stats(StatsEvent::FullListen {
                uid: uid.clone(),
                global_full_listen_count: stat.global_full_listen_count,
                cloud_full_listen_count: cloud_count,
            }))
            .ok();
        }

        self.signals
            .send(FullListenSignal {
                uid,
                global_full_listen_count: stat.global_full_listen_count,
                cloud_full_listen_count: cloud_count,
            })
            .ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteCacheStore;
    use bridge_traits::time::ManualClock;

    async fn core() -> (StatsCore, mpsc::UnboundedReceiver<FullListenSignal>, Arc<dyn CacheStore>) {
        let store: Arc<dyn CacheStore> = Arc::new(
            SqliteCacheStore::in_memory(Arc::new(ManualClock::default()))
                .await
                .unwrap(),
        );
        let (core, rx) = StatsCore::new(store.clone());
        (core, rx, store)
    }

    #[tokio::test]
    async fn test_just_below_threshold_does_not_count() {
        let (core, mut rx, store) = core().await;

        core.on_track_start("a", Duration::from_secs(1000));
        core.on_skip(Duration::from_millis(899_000)).await.unwrap();

        assert_eq!(store.get_global_stat("a").await.unwrap().global_full_listen_count, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_threshold_counts_once_per_play_through() {
        let (core, mut rx, store) = core().await;

        core.on_track_start("a", Duration::from_secs(1000));
        core.on_seek(Duration::from_secs(900)).await.unwrap();
        core.on_seek(Duration::from_secs(10)).await.unwrap();
        core.on_seek(Duration::from_secs(950)).await.unwrap();
        core.on_end().await.unwrap();

        assert_eq!(store.get_global_stat("a").await.unwrap().global_full_listen_count, 1);
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.uid, "a");
        assert_eq!(signal.cloud_full_listen_count, 1);
        assert!(rx.try_recv().is_err());

        core.on_track_start("a", Duration::from_secs(1000));
        core.on_end().await.unwrap();
        assert_eq!(store.get_global_stat("a").await.unwrap().global_full_listen_count, 2);
    }

    #[tokio::test]
    async fn test_ticks_accumulate_listen_seconds_while_playing() {
        let (core, _rx, store) = core().await;

        core.on_track_start("a", Duration::from_secs(100));
        core.tick().await.unwrap();
        core.tick().await.unwrap();
        core.on_pause();
        core.tick().await.unwrap();
        core.on_resume();
        core.tick().await.unwrap();

        assert_eq!(store.get_global_stat("a").await.unwrap().global_listen_seconds, 3);
        assert_eq!(store.global_total_listen_seconds().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ticking_through_the_track_counts() {
        let (core, mut rx, _store) = core().await;

        core.on_track_start("a", Duration::from_secs(10));
        for _ in 0..9 {
            core.tick().await.unwrap();
        }

        assert_eq!(rx.try_recv().unwrap().uid, "a");
        // Ending after the threshold was reached does not count again.
        core.on_end().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_without_play_through_are_ignored() {
        let (core, mut rx, _store) = core().await;

        core.on_pause();
        core.on_seek(Duration::from_secs(5)).await.unwrap();
        core.on_end().await.unwrap();
        core.tick().await.unwrap();

        assert!(core.current_uid().is_none());
        assert!(rx.try_recv().is_err());
    }
}
