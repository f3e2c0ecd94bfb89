//! Integration tests for the download queue
//!
//! These tests drive the real dispatcher against a mock HTTP server and an
//! in-memory store:
//! - At most one audio download at a time
//! - Priority order with FIFO ties, and merging of duplicates
//! - Backoff retries and terminal failures
//! - Parking on a blocked network and resuming
//! - Preemption and cancellation of the running task
//! - Stalled bodies and writes rejected by a full store

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{drain, eventually, test_config, url, Harness, MB};
use core_offline::queue::CapacityGuard;
use core_offline::{
    AudioBlob, CacheKind, CacheStore, ConnectionClass, DownloadQueue, DownloadTask, EnqueueOutcome,
    Priority, SqliteCacheStore, TrackMeta, Variant,
};
use core_runtime::events::{CoreEvent, DownloadEvent, QueueEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn audio(uid: &str, priority: Priority) -> DownloadTask {
    DownloadTask::audio(uid, Variant::Hi, url(uid, Variant::Hi), priority, CacheKind::Transient)
}

async fn has_blob(h: &Harness, uid: &str) -> bool {
    h.store.get_blob(uid).await.unwrap().is_some()
}

fn hi_requests(h: &Harness) -> Vec<String> {
    h.http.requests()
}

#[tokio::test]
async fn test_single_audio_download_at_a_time() {
    let h = Harness::new().await;
    for uid in ["a", "b", "c", "d"] {
        h.add_track(uid, 4096, 1024);
        h.http.slow(&url(uid, Variant::Hi), Duration::from_millis(80));
        h.queue.enqueue(audio(uid, Priority::P4));
    }

    let _dispatcher = h.queue.start();
    for uid in ["a", "b", "c", "d"] {
        eventually(uid, || has_blob(&h, uid)).await;
    }

    assert_eq!(h.http.max_active(), 1);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_priority_order_with_fifo_ties() {
    let h = Harness::new().await;
    for uid in ["a", "b", "c", "d"] {
        h.add_track(uid, 1024, 512);
    }

    h.queue.enqueue(audio("c", Priority::P6));
    h.queue.enqueue(audio("b", Priority::P4));
    h.queue.enqueue(audio("a", Priority::P2));
    h.queue.enqueue(audio("d", Priority::P4));

    let _dispatcher = h.queue.start();
    eventually("all downloads", || async { h.queue.status().queued == 0 && h.queue.status().active == 0 }).await;

    let expected: Vec<String> = ["a", "b", "d", "c"].iter().map(|uid| url(uid, Variant::Hi)).collect();
    assert_eq!(hi_requests(&h), expected);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_duplicate_merges_into_more_urgent_priority() {
    let h = Harness::new().await;
    h.add_track("a", 1024, 512);
    h.add_track("b", 1024, 512);

    assert_eq!(h.queue.enqueue(audio("a", Priority::P0)), EnqueueOutcome::Queued);
    assert_eq!(h.queue.enqueue(audio("b", Priority::P4)), EnqueueOutcome::Queued);
    assert_eq!(h.queue.enqueue(audio("a", Priority::P2)), EnqueueOutcome::Merged);

    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!((snapshot[0].uid.as_str(), snapshot[0].priority), ("a", Priority::P0));
    assert_eq!((snapshot[1].uid.as_str(), snapshot[1].priority), ("b", Priority::P4));

    let _dispatcher = h.queue.start();
    eventually("b", || has_blob(&h, "b")).await;

    assert_eq!(hi_requests(&h), vec![url("a", Variant::Hi), url("b", Variant::Hi)]);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_completion_writes_blob_and_metadata() {
    let h = Harness::new().await;
    h.add_track("a", 300_000, 1024);
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("a", Priority::P0));
    let _dispatcher = h.queue.start();
    eventually("a", || has_blob(&h, "a")).await;

    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert_eq!(meta.cached_variant, Some(Variant::Hi));
    assert_eq!(meta.cached_complete, 100);
    assert_eq!(meta.cache_kind, CacheKind::Transient);
    assert_eq!(meta.stored_size_bytes, Some(300_000));
    assert!(!meta.needs_update && !meta.needs_re_cache);
    assert_eq!(h.store.lru_order(), vec!["a".to_string()]);

    eventually("completed event", || async { h.queue.status().active == 0 }).await;
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::Download(DownloadEvent::Queued { uid, priority: 0, .. }) if uid == "a")));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::Download(DownloadEvent::Progress { percent: 100, .. }))));
    assert!(events.iter().any(
        |e| matches!(e, CoreEvent::Download(DownloadEvent::Completed { size_bytes: 300_000, .. }))
    ));
    h.queue.shutdown();
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let h = Harness::new().await;
    h.add_track("a", 2048, 1024);
    h.http.fail(&url("a", Variant::Hi), 2);
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("a", Priority::P0));
    let _dispatcher = h.queue.start();
    eventually("a", || has_blob(&h, "a")).await;

    assert_eq!(h.http.request_count(&url("a", Variant::Hi)), 3);
    let retries = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::Download(DownloadEvent::Retrying { .. })))
        .count();
    assert_eq!(retries, 2);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let h = Harness::new().await;
    h.add_track("a", 2048, 1024);
    h.http.fail(&url("a", Variant::Hi), 100);
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("a", Priority::P0));
    let _dispatcher = h.queue.start();

    let mut failed = None;
    eventually("failure event", || {
        for event in drain(&mut rx) {
            if let CoreEvent::Download(DownloadEvent::Failed { retries, .. }) = event {
                failed = Some(retries);
            }
        }
        let done = failed.is_some();
        async move { done }
    })
    .await;

    assert_eq!(failed, Some(2));
    assert_eq!(h.http.request_count(&url("a", Variant::Hi)), 3);
    assert_eq!(h.queue.status().queued, 0);
    assert!(!has_blob(&h, "a").await);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_truncated_body_is_not_stored() {
    let h = Harness::new().await;
    h.add_track("a", 2048, 1024);
    h.http.truncate(&url("a", Variant::Hi));

    h.queue.enqueue(audio("a", Priority::P0));
    let _dispatcher = h.queue.start();
    eventually("retries exhausted", || async {
        h.http.request_count(&url("a", Variant::Hi)) == 3 && h.queue.status().active == 0
    })
    .await;

    assert!(!has_blob(&h, "a").await);
    assert!(h.store.get_meta("a").await.unwrap().is_none());
    h.queue.shutdown();
}

#[tokio::test]
async fn test_blocked_network_parks_and_resumes() {
    let h = Harness::new().await;
    h.add_track("a", 2048, 1024);
    h.connectivity.set(ConnectionClass::Cellular);
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("a", Priority::P0));
    let _dispatcher = h.queue.start();
    eventually("parked", || async { h.queue.status().paused }).await;

    assert!(h.http.requests().is_empty());
    assert_eq!(h.queue.status().queued, 1);

    h.connectivity.set(ConnectionClass::Wifi);
    h.queue.notify_conditions_changed();
    eventually("a", || has_blob(&h, "a")).await;
    assert!(!h.queue.status().paused);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::Queue(QueueEvent::Parked { queued: 1, .. }))));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::Queue(QueueEvent::Resumed { .. }))));
    h.queue.shutdown();
}

#[tokio::test]
async fn test_urgent_task_preempts_running_download() {
    let h = Harness::new().await;
    h.add_track("a", 2048, 1024);
    h.add_track("b", 2048, 1024);
    h.http.slow(&url("b", Variant::Hi), Duration::from_millis(600));

    h.queue.enqueue(audio("b", Priority::P4));
    let _dispatcher = h.queue.start();
    eventually("b started", || async { h.http.request_count(&url("b", Variant::Hi)) == 1 }).await;

    h.queue.enqueue(audio("a", Priority::P0));
    assert!(h.queue.preempt(Priority::P0));

    eventually("a", || has_blob(&h, "a")).await;
    eventually("b", || has_blob(&h, "b")).await;

    assert_eq!(
        h.http.requests(),
        vec![url("b", Variant::Hi), url("a", Variant::Hi), url("b", Variant::Hi)]
    );
    assert_eq!(h.http.max_active(), 1);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_cancel_running_download_frees_the_slot() {
    let h = Harness::new().await;
    h.add_track("a", 2048, 1024);
    h.add_track("b", 2048, 1024);
    h.http.slow(&url("a", Variant::Hi), Duration::from_secs(3));
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("a", Priority::P2));
    h.queue.enqueue(audio("b", Priority::P4));
    let _dispatcher = h.queue.start();
    eventually("a started", || async { h.http.request_count(&url("a", Variant::Hi)) == 1 }).await;

    assert_eq!(h.queue.cancel("a"), 1);
    eventually("b", || has_blob(&h, "b")).await;

    assert!(!has_blob(&h, "a").await);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, CoreEvent::Download(DownloadEvent::Cancelled { uid, .. }) if uid == "a")));
    h.queue.shutdown();
}

#[tokio::test]
async fn test_download_larger_than_budget_fails_as_cache_full() {
    let h = Harness::new().await;
    h.set_cache_limit_mb(1).await;
    h.add_track("big", (2 * MB) as usize, 1024);
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("big", Priority::P2));
    let _dispatcher = h.queue.start();

    let mut message = None;
    eventually("failure event", || {
        for event in drain(&mut rx) {
            if let CoreEvent::Download(DownloadEvent::Failed { message: m, .. }) = event {
                message = Some(m);
            }
        }
        let done = message.is_some();
        async move { done }
    })
    .await;

    assert!(message.unwrap().starts_with("Cache full"));
    assert_eq!(h.http.request_count(&url("big", Variant::Hi)), 1);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_stalled_body_is_aborted_and_retried() {
    let h = Harness::with_config(test_config().with_stall_timeout(Duration::from_millis(100))).await;
    h.add_track("a", 4096, 1024);
    h.http.stall(&url("a", Variant::Hi), Duration::from_secs(5), 1);
    let mut rx = h.subscribe();

    h.queue.enqueue(audio("a", Priority::P0));
    let _dispatcher = h.queue.start();
    eventually("a after stall", || has_blob(&h, "a")).await;

    assert_eq!(h.http.request_count(&url("a", Variant::Hi)), 2);
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::Download(DownloadEvent::Retrying { uid, retries: 1, .. }) if uid == "a"
    )));
    h.queue.shutdown();
}

/// Frees nothing on the first call, then deletes `victim`.
struct ReclaimOnRetry {
    store: Arc<dyn CacheStore>,
    victim: String,
    calls: AtomicUsize,
}

#[async_trait]
impl CapacityGuard for ReclaimOnRetry {
    async fn make_room(&self, _incoming_bytes: u64, _uid: &str) -> core_offline::Result<u64> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(0);
        }
        self.store.delete_track(&self.victim).await
    }
}

async fn bounded_store(h: &Harness, capacity: u64) -> Arc<dyn CacheStore> {
    let store = SqliteCacheStore::in_memory(h.clock.clone())
        .await
        .unwrap()
        .with_capacity(capacity);
    let store: Arc<dyn CacheStore> = Arc::new(store);

    let mut old = TrackMeta::new("old");
    old.cache_kind = CacheKind::Transient;
    old.cached_variant = Some(Variant::Lo);
    old.cached_complete = 100;
    old.stored_size_bytes = Some(6_000);
    let blob = AudioBlob::new("old", Variant::Lo, Bytes::from(vec![3u8; 6_000]), 0);
    store.put_blob_with_meta(&blob, &old).await.unwrap();
    store
}

#[tokio::test]
async fn test_full_store_reclaims_once_then_persists() {
    let h = Harness::new().await;
    h.add_track("a", 5_000, 1_000);
    let store = bounded_store(&h, 10_000).await;
    let guard = Arc::new(ReclaimOnRetry {
        store: store.clone(),
        victim: "old".to_string(),
        calls: AtomicUsize::new(0),
    });
    let queue = DownloadQueue::builder(h.http.clone(), store.clone(), h.clock.clone())
        .capacity_guard(guard.clone())
        .config(h.config.clone())
        .build();

    queue.enqueue(audio("a", Priority::P2));
    let _dispatcher = queue.start();
    eventually("a in bounded store", || async {
        store.get_blob("a").await.unwrap().is_some()
    })
    .await;

    // One check before the write, one reclaim after the store refused it.
    assert_eq!(guard.calls.load(Ordering::SeqCst), 2);
    assert!(store.get_blob("old").await.unwrap().is_none());
    assert_eq!(store.total_bytes().await.unwrap(), 5_000);
    queue.shutdown();
}

#[tokio::test]
async fn test_full_store_without_room_reports_cache_full() {
    let h = Harness::new().await;
    h.add_track("a", 5_000, 1_000);
    let store = bounded_store(&h, 10_000).await;
    let bus = h.bus.clone();
    let mut rx = h.subscribe();
    let queue = DownloadQueue::builder(h.http.clone(), store.clone(), h.clock.clone())
        .event_bus(bus)
        .config(h.config.clone())
        .build();

    queue.enqueue(audio("a", Priority::P2));
    let _dispatcher = queue.start();
    eventually("attempt finished", || async {
        let status = queue.status();
        h.http.request_count(&url("a", Variant::Hi)) == 1 && status.active == 0 && status.queued == 0
    })
    .await;

    assert!(store.get_blob("a").await.unwrap().is_none());
    assert!(store.get_blob("old").await.unwrap().is_some());
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::Download(DownloadEvent::Failed { uid, message, .. })
            if uid == "a" && message.starts_with("Cache full")
    )));
    queue.shutdown();
}
