//! Property-based tests for the hot-key detector.
//!
//! Uses proptest to generate random access streams and checks the detector's
//! bookkeeping holds for all of them.
//!
//! Run with: `cargo test --test proptest_detector`

use proptest::prelude::*;

use like_engine::{HotKeyConfig, HotKeyDetector};

// =============================================================================
// Strategies
// =============================================================================

/// Access stream over a small key space so collisions and repeats happen.
fn access_stream() -> impl Strategy<Value = Vec<(u8, u32)>> {
    prop::collection::vec((0u8..40, 1u32..20), 1..400)
}

fn detector(k: usize, width: usize, min_count: u32, seed: u64) -> HotKeyDetector {
    HotKeyDetector::new(HotKeyConfig {
        k,
        width,
        depth: 4,
        decay: 0.92,
        min_count,
        seed: Some(seed),
    })
}

proptest! {
    #[test]
    fn total_is_sum_of_weights(stream in access_stream(), seed in any::<u64>()) {
        let d = detector(10, 64, 1, seed);
        let mut expected = 0u64;
        for (key, weight) in &stream {
            d.observe(&format!("k{}", key), *weight);
            expected += u64::from(*weight);
        }
        prop_assert_eq!(d.total(), expected);
    }

    #[test]
    fn snapshot_is_bounded_and_sorted(
        stream in access_stream(),
        k in 1usize..15,
        seed in any::<u64>(),
    ) {
        let d = detector(k, 32, 1, seed);
        for (key, weight) in &stream {
            d.observe(&format!("k{}", key), *weight);
        }
        let snapshot = d.snapshot();
        prop_assert!(snapshot.len() <= k);
        for pair in snapshot.windows(2) {
            prop_assert!(pair[0].1 >= pair[1].1);
        }
        let mut keys: Vec<&String> = snapshot.iter().map(|(key, _)| key).collect();
        keys.sort();
        keys.dedup();
        prop_assert_eq!(keys.len(), snapshot.len());
    }

    #[test]
    fn snapshot_counts_respect_min_count(stream in access_stream(), min_count in 1u32..50) {
        let d = detector(20, 256, min_count, 7);
        for (key, weight) in &stream {
            d.observe(&format!("k{}", key), *weight);
        }
        for (_, count) in d.snapshot() {
            prop_assert!(count >= min_count);
        }
    }

    #[test]
    fn is_hot_agrees_with_snapshot(stream in access_stream()) {
        let d = detector(5, 64, 1, 3);
        for (key, weight) in &stream {
            d.observe(&format!("k{}", key), *weight);
        }
        let snapshot = d.snapshot();
        for key in 0u8..40 {
            let key = format!("k{}", key);
            prop_assert_eq!(d.is_hot(&key), snapshot.iter().any(|(k, _)| *k == key));
        }
    }

    #[test]
    fn decay_halves_total(stream in access_stream()) {
        let d = detector(10, 64, 1, 11);
        for (key, weight) in &stream {
            d.observe(&format!("k{}", key), *weight);
        }
        let before = d.total();
        d.decay();
        prop_assert_eq!(d.total(), before / 2);
    }
}

#[test]
fn heavy_hitter_is_reported_first() {
    let d = detector(5, 1024, 10, 42);
    for round in 0..2_000u32 {
        d.observe("heavy", 1);
        d.observe(&format!("noise-{}", round % 500), 1);
    }
    let snapshot = d.snapshot();
    assert_eq!(snapshot.first().map(|(key, _)| key.as_str()), Some("heavy"));
    assert!(snapshot[0].1 >= 1_500);
}
