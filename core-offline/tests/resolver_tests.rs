//! Integration tests for playback source resolution

mod common;

use common::{url, Harness};
use core_offline::{
    CacheKind, CacheStore, CatalogEntry, ConnectionClass, Mode, OfflineError, PlaybackSource,
    TrackResolver, Variant,
};

fn resolver(h: &Harness) -> TrackResolver {
    TrackResolver::new(h.store(), h.policy.clone(), h.catalog.clone(), h.connectivity.clone())
}

#[tokio::test]
async fn test_exact_local_copy_wins() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Hi, 4096, CacheKind::Transient).await;

    let resolved = resolver(&h).resolve("a").await.unwrap();

    assert!(resolved.is_local);
    assert!(!resolved.degraded);
    assert_eq!(resolved.effective_quality, Variant::Hi);
    assert_eq!(resolved.blob().unwrap().size_bytes, 4096);
    assert_eq!(h.store.lru_order(), vec!["a".to_string()]);
    assert!(h.http.requests().is_empty());
}

#[tokio::test]
async fn test_wrong_variant_streams_when_network_allowed() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Lo, 1024, CacheKind::Transient).await;

    let resolved = resolver(&h).resolve("a").await.unwrap();

    assert!(!resolved.is_local);
    assert_eq!(resolved.url(), Some(url("a", Variant::Hi).as_str()));
    assert_eq!(resolved.effective_quality, Variant::Hi);
    assert!(!h.store.get_meta("a").await.unwrap().unwrap().needs_re_cache);
}

#[tokio::test]
async fn test_falls_back_to_the_other_remote_variant() {
    let h = Harness::new().await;
    h.catalog
        .insert(CatalogEntry::new("lo-only").with_lo(url("lo-only", Variant::Lo), Some(1024)));

    let resolved = resolver(&h).resolve("lo-only").await.unwrap();

    assert_eq!(resolved.effective_quality, Variant::Lo);
    match resolved.source {
        PlaybackSource::Network { url: ref remote } => {
            assert_eq!(remote, &url("lo-only", Variant::Lo));
        }
        PlaybackSource::Local(_) => panic!("expected a network source"),
    }
}

#[tokio::test]
async fn test_degraded_local_copy_when_offline() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.seed("a", Variant::Lo, 1024, CacheKind::Transient).await;
    h.connectivity.set(ConnectionClass::Cellular);

    let resolved = resolver(&h).resolve("a").await.unwrap();

    assert!(resolved.is_local);
    assert!(resolved.degraded);
    assert_eq!(resolved.effective_quality, Variant::Lo);
    assert!(h.store.get_meta("a").await.unwrap().unwrap().needs_re_cache);

    let summary = resolved.summary();
    assert!(summary.degraded);
    assert_eq!(summary.uid, "a");
}

#[tokio::test]
async fn test_nothing_playable_is_an_error() {
    let h = Harness::new().await;
    h.add_track("a", 4096, 1024);
    h.connectivity.set(ConnectionClass::Cellular);

    let err = resolver(&h).resolve("a").await.unwrap_err();
    assert!(matches!(err, OfflineError::SourceUnavailable(_)));

    h.connectivity.set(ConnectionClass::Wifi);
    let err = resolver(&h).resolve("not-in-catalog").await.unwrap_err();
    assert!(matches!(err, OfflineError::SourceUnavailable(_)));
}

#[tokio::test]
async fn test_full_offline_never_touches_the_network() {
    let h = Harness::new().await;
    h.add_track("hi", 4096, 1024);
    h.add_track("lo", 4096, 1024);
    h.add_track("none", 4096, 1024);
    h.seed("hi", Variant::Hi, 4096, CacheKind::Cloud).await;
    h.seed("lo", Variant::Lo, 1024, CacheKind::Cloud).await;
    h.policy.set_mode(Mode::R3).await.unwrap();
    let resolver = resolver(&h);

    let exact = resolver.resolve("hi").await.unwrap();
    assert!(exact.is_local && !exact.degraded);

    let degraded = resolver.resolve("lo").await.unwrap();
    assert!(degraded.is_local && degraded.degraded);

    assert!(matches!(
        resolver.resolve("none").await,
        Err(OfflineError::SourceUnavailable(_))
    ));
}
