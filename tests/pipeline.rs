//! End-to-end pipeline tests on in-memory collaborators.
//!
//! Exercises toggles → ledger / events → flush / consumer → durable counts
//! without any external services.
//!
//! Run with: `cargo test --test pipeline`

use std::sync::Arc;
use std::time::Duration;

use like_engine::storage::memory::{InMemoryKv, InMemoryLikeStore};
use like_engine::{
    EventChannel, InMemoryChannel, KvStore, LikeEngine, LikeEngineConfig, LikeError, LikeEvent, LikeStore,
    WriteMode,
};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    engine: Arc<LikeEngine>,
    kv: Arc<InMemoryKv>,
    store: Arc<InMemoryLikeStore>,
    channel: Arc<InMemoryChannel>,
}

fn harness(mode: WriteMode) -> Harness {
    let config = LikeEngineConfig {
        write_mode: mode,
        consumer_poll_ms: 0,
        hotkey_min_count: 5,
        hotkey_seed: Some(42),
        ..Default::default()
    };
    let kv = Arc::new(InMemoryKv::new());
    let store = Arc::new(InMemoryLikeStore::new());
    let channel = Arc::new(InMemoryChannel::new());
    let events: Option<Arc<dyn EventChannel>> = match mode {
        WriteMode::Event => Some(channel.clone()),
        WriteMode::Ledger => None,
    };
    let engine = LikeEngine::new(config, kv.clone(), store.clone(), events).expect("valid config");
    Harness { engine: Arc::new(engine), kv, store, channel }
}

// =============================================================================
// Ledger mode
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ledger_concurrent_confirms_from_distinct_actors() {
    let h = harness(WriteMode::Ledger);

    let mut tasks = Vec::new();
    for actor in 0..1000u64 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move { engine.confirm(actor, 42).await }));
    }
    for task in tasks {
        task.await.unwrap().expect("each actor likes once");
    }

    let report = h.engine.flush_all().await.unwrap();
    assert_eq!(report.applied.inserted, 1000);
    assert_eq!(h.engine.like_count(42).await.unwrap(), 1000);
    assert!(h.kv.scan_prefix("like:ledger:").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ledger_concurrent_duplicate_confirms_apply_once() {
    let h = harness(WriteMode::Ledger);

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move { engine.confirm(7, 42).await }));
    }
    let mut applied = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => applied += 1,
            Err(LikeError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(conflicts, 49);

    h.engine.flush_all().await.unwrap();
    assert_eq!(h.engine.like_count(42).await.unwrap(), 1);
}

#[tokio::test]
async fn ledger_confirm_cancel_confirm_nets_one() {
    let h = harness(WriteMode::Ledger);

    h.engine.confirm(7, 42).await.unwrap();
    h.engine.cancel(7, 42).await.unwrap();
    h.engine.confirm(7, 42).await.unwrap();
    h.engine.flush_all().await.unwrap();

    assert_eq!(h.engine.like_count(42).await.unwrap(), 1);
    assert!(h.store.has_like(7, 42).await.unwrap());
    assert!(h.engine.has_liked(7, 42).await.unwrap());
}

#[tokio::test]
async fn ledger_cancel_after_flush_removes_fact() {
    let h = harness(WriteMode::Ledger);

    h.engine.confirm(7, 42).await.unwrap();
    h.engine.flush_all().await.unwrap();
    h.engine.cancel(7, 42).await.unwrap();
    h.engine.flush_all().await.unwrap();

    assert_eq!(h.engine.like_count(42).await.unwrap(), 0);
    assert!(!h.engine.has_liked(7, 42).await.unwrap());
}

#[tokio::test]
async fn ledger_reflush_is_idempotent() {
    let h = harness(WriteMode::Ledger);
    h.engine.confirm(1, 42).await.unwrap();
    h.engine.confirm(2, 42).await.unwrap();
    h.engine.flush_all().await.unwrap();

    // simulate a crash between commit and release by restaging the same delta
    h.kv.hset("like:ledger:10:00:00", "1:42", "1").await.unwrap();
    let report = h.engine.flush_all().await.unwrap();

    assert_eq!(report.applied.inserted, 0);
    assert_eq!(h.engine.like_count(42).await.unwrap(), 2);
}

#[tokio::test]
async fn liked_among_reports_each_item() {
    let h = harness(WriteMode::Ledger);
    h.engine.confirm(7, 1).await.unwrap();
    h.engine.confirm(7, 3).await.unwrap();

    let flags = h.engine.liked_among(7, &[1, 2, 3]).await.unwrap();
    assert_eq!(flags.get(&1), Some(&true));
    assert_eq!(flags.get(&2), Some(&false));
    assert_eq!(flags.get(&3), Some(&true));
}

#[tokio::test]
async fn busy_actor_becomes_hot() {
    let h = harness(WriteMode::Ledger);

    for item in 0..20u64 {
        h.engine.confirm(7, item).await.unwrap();
    }
    h.engine.confirm(8, 0).await.unwrap();

    let hot = h.engine.hot_keys();
    assert_eq!(hot.first().map(|(k, _)| k.as_str()), Some("like:user:7"));
    assert!(!hot.iter().any(|(k, _)| k == "like:user:8"));
}

// =============================================================================
// Event mode
// =============================================================================

#[tokio::test]
async fn event_mode_consumes_and_counts() {
    let h = harness(WriteMode::Event);

    for actor in 0..10u64 {
        h.engine.confirm(actor, 42).await.unwrap();
    }
    h.engine.cancel(3, 42).await.unwrap();

    let report = h.engine.consume_now().await.unwrap();
    assert_eq!(report.delivered, 11);
    // actor 3's INCR+DECR pair cancels out
    assert_eq!(report.discarded_groups, 1);
    assert_eq!(h.engine.like_count(42).await.unwrap(), 9);
    assert_eq!(h.channel.pending_len(), 0);
}

#[tokio::test]
async fn event_mode_zero_drift_reconcile_emits_nothing() {
    let h = harness(WriteMode::Event);
    h.engine.confirm(1, 42).await.unwrap();
    h.engine.confirm(2, 43).await.unwrap();
    h.engine.consume_now().await.unwrap();

    let report = h.engine.reconcile_now().await.unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.repaired, 0);
    assert_eq!(h.channel.queued_len(), 0);
}

#[tokio::test]
async fn event_mode_lost_event_is_repaired() {
    let h = harness(WriteMode::Event);
    h.engine.confirm(1, 42).await.unwrap();

    // lose the event: drain and ack without applying
    let lost = h.channel.poll_batch(10, Duration::ZERO).await.unwrap();
    let ids: Vec<String> = lost.into_iter().map(|d| d.id).collect();
    h.channel.ack(&ids).await.unwrap();
    assert_eq!(h.engine.like_count(42).await.unwrap(), 0);

    let report = h.engine.reconcile_now().await.unwrap();
    assert_eq!(report.repaired, 1);

    h.engine.consume_now().await.unwrap();
    assert_eq!(h.engine.like_count(42).await.unwrap(), 1);

    // reconciling again finds nothing
    assert_eq!(h.engine.reconcile_now().await.unwrap().repaired, 0);
}

#[tokio::test]
async fn event_mode_duplicate_compensation_is_absorbed() {
    let h = harness(WriteMode::Event);
    h.engine.confirm(1, 42).await.unwrap();

    // reconciliation racing an in-flight INCR publishes a second INCR
    h.channel.publish(&LikeEvent::incr(1, 42, 1)).await.unwrap();
    h.engine.consume_now().await.unwrap();
    h.channel.publish(&LikeEvent::incr(1, 42, 2)).await.unwrap();
    h.engine.consume_now().await.unwrap();

    assert_eq!(h.engine.like_count(42).await.unwrap(), 1);
    assert_eq!(h.store.len(), 1);
}
