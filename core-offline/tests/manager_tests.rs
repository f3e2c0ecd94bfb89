//! Integration tests for the offline manager
//!
//! Covers pinning, cloud promotion and expiry, staleness detection,
//! full-offline activation and the UI-facing accessors.

mod common;

use common::{drain, eventually, url, Harness};
use core_offline::{
    CacheKind, CacheStore, DownloadTask, FullListenSignal, Mode, OfflineError, Priority,
    StatsCore, Variant,
};
use core_runtime::events::{CoreEvent, OfflineEvent};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DAY_SECS: i64 = 24 * 60 * 60;

fn signal(uid: &str, count: u32) -> FullListenSignal {
    FullListenSignal {
        uid: uid.to_string(),
        global_full_listen_count: u64::from(count),
        cloud_full_listen_count: count,
    }
}

fn now_secs(h: &Harness) -> i64 {
    use bridge_traits::time::Clock;
    h.clock.unix_timestamp()
}

// ============================================================================
// Pinning
// ============================================================================

#[tokio::test]
async fn test_pin_queues_download_at_cache_quality() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);

    h.manager.pin("a").await.unwrap();

    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert!(meta.pinned);
    assert_eq!(meta.cache_kind, CacheKind::Pinned);

    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].priority, Priority::P2);
    assert_eq!(snapshot[0].variant, Some(h.policy.cache_quality()));
    assert_eq!(snapshot[0].cache_kind, CacheKind::Pinned);

    let _dispatcher = h.queue.start();
    eventually("pinned copy", || async {
        h.store.get_blob("a").await.unwrap().is_some()
    })
    .await;
    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert!(meta.pinned);
    assert_eq!(meta.cache_kind, CacheKind::Pinned);
    assert_eq!(meta.cached_variant, Some(Variant::Lo));
    h.queue.shutdown();
}

#[tokio::test]
async fn test_pin_during_running_download_survives_completion() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.http.slow(&url("a", Variant::Hi), Duration::from_millis(300));
    h.http.slow(&url("a", Variant::Lo), Duration::from_millis(1500));
    h.queue.enqueue(DownloadTask::audio(
        "a",
        Variant::Hi,
        url("a", Variant::Hi),
        Priority::P0,
        CacheKind::Transient,
    ));
    let _dispatcher = h.queue.start();
    eventually("transient download running", || async { h.queue.status().active == 1 }).await;

    h.manager.pin("a").await.unwrap();
    eventually("transient copy", || async {
        h.store
            .get_meta("a")
            .await
            .unwrap()
            .is_some_and(|meta| meta.is_complete_at(Variant::Hi))
    })
    .await;

    // The pinned Lo download is still running; the finished transient one
    // must not have overwritten the pin.
    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert!(meta.pinned);
    assert_eq!(meta.cache_kind, CacheKind::Pinned);
    let candidates = h.evictor.candidates(None).await.unwrap();
    assert!(candidates.iter().all(|meta| meta.uid != "a"));
    h.queue.shutdown();
}

#[tokio::test]
async fn test_pin_of_complete_copy_skips_download() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Lo, 1024, CacheKind::Transient).await;

    h.manager.pin("a").await.unwrap();

    assert!(h.queue.snapshot().is_empty());
    assert_eq!(
        h.store.get_meta("a").await.unwrap().unwrap().cache_kind,
        CacheKind::Pinned
    );
}

#[tokio::test]
async fn test_pin_unknown_track_fails() {
    let h = Harness::new().await;
    let err = h.manager.pin("ghost").await.unwrap_err();
    assert!(matches!(err, OfflineError::TrackNotFound(_)));
    assert!(h.store.get_meta("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unpin_demotes_to_cloud_candidate() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Lo, 1024, CacheKind::Pinned).await;

    h.manager.unpin("a").await.unwrap();

    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert!(!meta.pinned);
    assert!(meta.cloud);
    assert_eq!(meta.cache_kind, CacheKind::Cloud);
    assert_eq!(meta.cloud_expires_at, Some(now_secs(&h) + 30 * DAY_SECS));
    assert!(h.store.get_blob("a").await.unwrap().is_some());
}

// ============================================================================
// Cloud Lifecycle
// ============================================================================

#[tokio::test]
async fn test_promotion_needs_threshold_listens() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    let mut rx = h.subscribe();

    assert!(!h.manager.on_full_listen(&signal("a", 2)).await.unwrap());
    assert!(h.manager.on_full_listen(&signal("a", 3)).await.unwrap());

    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert!(meta.cloud);
    assert_eq!(meta.cloud_expires_at, Some(now_secs(&h) + 30 * DAY_SECS));

    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].priority, Priority::P4);
    assert_eq!(snapshot[0].cache_kind, CacheKind::Cloud);

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        CoreEvent::Offline(OfflineEvent::CloudPromoted { full_listen_count: 3, .. })
    )));

    // Still valid: a further listen keeps the existing expiry.
    h.clock.advance(chrono::Duration::days(1));
    assert!(!h.manager.on_full_listen(&signal("a", 4)).await.unwrap());
    let relistened = h.store.get_meta("a").await.unwrap().unwrap();
    assert_eq!(relistened.cloud_expires_at, meta.cloud_expires_at);
    assert_eq!(relistened.cloud_added_at, meta.cloud_added_at);
}

#[tokio::test]
async fn test_stats_drive_promotion() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    let (stats, signals) = StatsCore::new(h.store());
    let shutdown = CancellationToken::new();
    let _listener = h.manager.clone().spawn_promotion_listener(signals, shutdown.clone());

    for _ in 0..3 {
        stats.on_track_start("a", Duration::from_secs(100));
        stats.on_skip(Duration::from_secs(95)).await.unwrap();
    }

    eventually("promotion", || async {
        h.store
            .get_meta("a")
            .await
            .unwrap()
            .is_some_and(|meta| meta.cloud)
    })
    .await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_expiry_sweep_resets_cloud_stats_only() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Lo, 1024, CacheKind::Transient).await;
    for _ in 0..3 {
        h.store.record_full_listen("a").await.unwrap();
    }
    assert!(h.manager.on_full_listen(&signal("a", 3)).await.unwrap());
    assert!(h.queue.snapshot().is_empty());

    h.clock.advance(chrono::Duration::days(29));
    assert!(h.manager.sweep_expired().await.unwrap().is_empty());

    h.clock.advance(chrono::Duration::days(2));
    let mut rx = h.subscribe();
    assert_eq!(h.manager.sweep_expired().await.unwrap(), vec!["a".to_string()]);

    assert!(h.store.get_blob("a").await.unwrap().is_none());
    assert!(h.store.get_meta("a").await.unwrap().is_none());
    assert_eq!(h.store.get_global_stat("a").await.unwrap().global_full_listen_count, 3);

    let (stat, cloud_count) = h.store.record_full_listen("a").await.unwrap();
    assert_eq!(stat.global_full_listen_count, 4);
    assert_eq!(cloud_count, 1);

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        CoreEvent::Offline(OfflineEvent::CloudExpired { uid, .. }) if uid == "a"
    )));
}

#[tokio::test]
async fn test_sweep_keeps_pinned_tracks() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.manager.on_full_listen(&signal("a", 3)).await.unwrap();
    h.manager.pin("a").await.unwrap();

    h.clock.advance(chrono::Duration::days(60));
    assert!(h.manager.sweep_expired().await.unwrap().is_empty());
    assert!(h.store.get_meta("a").await.unwrap().unwrap().pinned);
}

// ============================================================================
// Freshness
// ============================================================================

#[tokio::test]
async fn test_size_mismatch_flags_update_and_keeps_copy() {
    let h = Harness::new().await;
    h.add_track("a", 50_000, 1024);
    h.seed("a", Variant::Hi, 20_000, CacheKind::Cloud).await;
    h.add_track("b", 10_000, 1024);
    h.seed("b", Variant::Hi, 10_000, CacheKind::Cloud).await;
    let mut rx = h.subscribe();

    let flagged = h.manager.check_staleness().await.unwrap();

    assert_eq!(flagged, vec!["a".to_string()]);
    let meta = h.store.get_meta("a").await.unwrap().unwrap();
    assert!(meta.needs_update);
    assert!(h.store.get_blob("a").await.unwrap().is_some());

    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].uid, "a");
    assert_eq!(snapshot[0].priority, Priority::P3);

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        CoreEvent::Offline(OfflineEvent::NeedsUpdate { declared_bytes: 50_000, stored_bytes: 20_000, .. })
    )));
}

#[tokio::test]
async fn test_refresh_download_clears_needs_update() {
    let h = Harness::new().await;
    h.add_track("a", 50_000, 1024);
    h.seed("a", Variant::Hi, 20_000, CacheKind::Cloud).await;
    h.manager.check_staleness().await.unwrap();

    let _dispatcher = h.queue.start();
    eventually("refresh", || async {
        h.store
            .get_meta("a")
            .await
            .unwrap()
            .is_some_and(|meta| !meta.needs_update && meta.stored_size_bytes == Some(50_000))
    })
    .await;
    assert_eq!(
        h.store.get_meta("a").await.unwrap().unwrap().cache_kind,
        CacheKind::Cloud
    );
    h.queue.shutdown();
}

#[tokio::test]
async fn test_re_cache_queues_proper_quality() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Lo, 1024, CacheKind::Transient).await;
    h.store.mark_needs_re_cache("a").await.unwrap();

    assert_eq!(h.manager.process_re_cache().await.unwrap(), 1);

    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot[0].priority, Priority::P3);
    assert_eq!(snapshot[0].variant, Some(h.policy.active_playback_quality()));
}

// ============================================================================
// Full Offline
// ============================================================================

#[tokio::test]
async fn test_full_offline_requires_complete_selection() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.add_track("b", 4096, 1024);
    h.seed("a", Variant::Hi, 4096, CacheKind::Cloud).await;

    h.manager
        .set_offline_selection(vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();

    match h.manager.activate_full_offline().await {
        Err(OfflineError::OfflineSelectionIncomplete { missing }) => {
            assert_eq!(missing, vec!["b".to_string()]);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(h.policy.mode(), Mode::R0);

    assert_eq!(h.manager.download_offline_selection().await.unwrap(), 1);
    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot[0].uid, "b");
    assert_eq!(snapshot[0].priority, Priority::P6);

    let _dispatcher = h.queue.start();
    eventually("b", || async { h.store.get_blob("b").await.unwrap().is_some() }).await;

    h.manager.activate_full_offline().await.unwrap();
    assert_eq!(h.policy.mode(), Mode::R3);
    h.queue.shutdown();
}

#[tokio::test]
async fn test_selected_tracks_are_not_evicted() {
    let h = Harness::new().await;
    h.set_cache_limit_mb(1).await;
    h.seed("keep", Variant::Hi, 600_000, CacheKind::Cloud).await;
    h.manager.set_offline_selection(vec!["keep".to_string()]).await.unwrap();

    let candidates = h.evictor.candidates(None).await.unwrap();
    assert!(candidates.is_empty());

    h.manager.set_offline_selection(Vec::new()).await.unwrap();
    assert_eq!(h.evictor.candidates(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_selection_and_thresholds_survive_restart() {
    let h = Harness::new().await;
    h.manager.set_offline_selection(vec!["a".into(), "b".into(), "a".into()]).await.unwrap();
    h.manager.set_cloud_thresholds(5, 7).await.unwrap();

    let restarted = Harness::with_settings(h.settings.clone()).await;

    assert_eq!(restarted.manager.offline_selection(), vec!["a".to_string(), "b".to_string()]);
    let thresholds = restarted.manager.cloud_thresholds();
    assert_eq!((thresholds.listen_threshold, thresholds.ttl_days), (5, 7));
}

// ============================================================================
// UI Surface
// ============================================================================

#[tokio::test]
async fn test_breakdown_and_offline_state() {
    let h = Harness::new().await;
    h.seed("p", Variant::Lo, 1000, CacheKind::Pinned).await;
    h.seed("c", Variant::Lo, 2000, CacheKind::Cloud).await;
    h.seed("t", Variant::Hi, 3000, CacheKind::Transient).await;

    let breakdown = h.manager.get_breakdown().await.unwrap();
    assert_eq!(breakdown.pinned_bytes, 1000);
    assert_eq!(breakdown.cloud_bytes, 2000);
    assert_eq!(breakdown.transient_bytes, 3000);

    let state = h.manager.get_track_offline_state("p").await.unwrap();
    assert!(state.pinned);
    assert_eq!(state.cached_complete, 100);

    let unknown = h.manager.get_track_offline_state("nope").await.unwrap();
    assert_eq!(unknown.cached_complete, 0);
    assert!(!unknown.pinned);
}

#[tokio::test]
async fn test_clear_all_cache() {
    let h = Harness::new().await;
    h.add_track("q", 4096, 1024);
    h.seed("a", Variant::Lo, 1000, CacheKind::Cloud).await;
    h.seed("b", Variant::Lo, 2000, CacheKind::Pinned).await;
    h.store.add_listen_seconds("a", 30).await.unwrap();
    h.manager.pin("q").await.unwrap();
    let mut rx = h.subscribe();

    let summary = h.manager.clear_all_cache().await.unwrap();

    assert_eq!(summary.freed_bytes, 3000);
    assert_eq!(h.store.total_bytes().await.unwrap(), 0);
    assert_eq!(h.queue.status().queued, 0);
    assert_eq!(h.store.get_global_stat("a").await.unwrap().global_listen_seconds, 30);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        CoreEvent::Offline(OfflineEvent::CacheCleared { freed_bytes: 3000, .. })
    )));
}

#[tokio::test]
async fn test_maintenance_pass_runs_every_job() {
    let h = Harness::new().await;
    h.add_track("stale", 50_000, 1024);
    h.seed("stale", Variant::Hi, 20_000, CacheKind::Transient).await;
    h.manager.on_full_listen(&signal("gone", 3)).await.unwrap();
    h.clock.advance(chrono::Duration::days(31));

    let report = h.manager.run_maintenance().await;

    assert_eq!(report.expired, vec!["gone".to_string()]);
    assert_eq!(report.stale, vec!["stale".to_string()]);
    assert_eq!(report.evicted_bytes, 0);
}

#[tokio::test]
async fn test_prefetch_asset_downloads_once() {
    let h = Harness::new().await;
    h.http.serve("https://cdn.test/art/a.jpg", vec![1u8; 512]);
    h.catalog.insert_asset("art:a", "https://cdn.test/art/a.jpg");

    assert!(h.manager.prefetch_asset("art:a").await.unwrap());
    let snapshot = h.queue.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].priority, Priority::P5);

    let _dispatcher = h.queue.start();
    eventually("asset", || async {
        h.manager.get_asset("art:a").await.unwrap().is_some()
    })
    .await;
    assert_eq!(h.manager.get_asset("art:a").await.unwrap().unwrap().len(), 512);

    assert!(!h.manager.prefetch_asset("art:a").await.unwrap());
    assert!(matches!(
        h.manager.prefetch_asset("art:missing").await,
        Err(OfflineError::SourceUnavailable(_))
    ));
    h.queue.shutdown();
}
