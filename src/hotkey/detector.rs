// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-K hot-key detector: sketch + bounded candidate heap + eviction queue.
//!
//! Lock discipline: [`HotKeyDetector::observe`] touches bucket locks one at a
//! time, then the atomic total, then the heap lock alone. No call ever holds
//! two of these at once, so there is no ordering to get wrong.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::debug;

use super::heap::{Candidate, IndexedMinHeap};
use super::sketch::Sketch;
use super::HotKeyConfig;
use crate::metrics;

/// Outcome of one [`HotKeyDetector::observe`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveResult {
    /// Key pushed out of the Top-K set by this observation
    pub evicted_key: Option<String>,
    /// Whether `key` is in the Top-K set after this observation
    pub is_hot: bool,
    pub key: String,
}

impl ObserveResult {
    fn cold(key: &str) -> Self {
        Self { evicted_key: None, is_hot: false, key: key.to_string() }
    }
}

/// A key that left the Top-K set, paired with the count of the key that displaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedItem {
    pub key: String,
    pub count_at_eviction: u32,
}

/// Single-consumer handle on the eviction queue.
pub struct EvictedQueue {
    rx: mpsc::UnboundedReceiver<EvictedItem>,
}

impl EvictedQueue {
    /// Wait up to `wait` for the next eviction.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<EvictedItem> {
        tokio::time::timeout(wait, self.rx.recv()).await.ok().flatten()
    }

    pub fn try_recv(&mut self) -> Option<EvictedItem> {
        self.rx.try_recv().ok()
    }
}

pub struct HotKeyDetector {
    k: usize,
    min_count: u32,
    sketch: Sketch,
    heap: Mutex<IndexedMinHeap>,
    total: AtomicU64,
    seed_source: AtomicU64,
    evicted_tx: mpsc::UnboundedSender<EvictedItem>,
    evicted_rx: Mutex<Option<mpsc::UnboundedReceiver<EvictedItem>>>,
}

impl HotKeyDetector {
    pub fn new(config: HotKeyConfig) -> Self {
        let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        let k = config.k.max(1);
        Self {
            k,
            min_count: config.min_count,
            sketch: Sketch::new(config.width, config.depth, config.decay),
            heap: Mutex::new(IndexedMinHeap::with_capacity(k)),
            total: AtomicU64::new(0),
            seed_source: AtomicU64::new(config.seed.unwrap_or_else(rand::random)),
            evicted_tx,
            evicted_rx: Mutex::new(Some(evicted_rx)),
        }
    }

    /// Record `weight` accesses of `key` and update its Top-K membership.
    pub fn observe(&self, key: &str, weight: u32) -> ObserveResult {
        let mut result = ObserveResult::cold(key);
        if weight == 0 {
            return result;
        }

        let mut rng = SmallRng::seed_from_u64(self.seed_source.fetch_add(1, Ordering::Relaxed));
        let max_count = self.sketch.add(key.as_bytes(), weight, &mut rng);
        self.total.fetch_add(u64::from(weight), Ordering::Relaxed);

        if max_count < self.min_count {
            return result;
        }

        let evicted = {
            let mut heap = self.heap.lock();
            if heap.update(key, max_count) {
                result.is_hot = true;
                return result;
            }

            if heap.len() < self.k {
                heap.push(Candidate { key: key.to_string(), count: max_count });
                result.is_hot = true;
                None
            } else if heap.peek_min().is_some_and(|min| max_count >= min.count) {
                let min = heap.pop_min();
                heap.push(Candidate { key: key.to_string(), count: max_count });
                result.is_hot = true;
                min
            } else {
                None
            }
        };

        if result.is_hot {
            metrics::record_hot_admission();
            debug!(key, count = max_count, "Key admitted to Top-K");
        }
        if let Some(min) = evicted {
            metrics::record_hot_eviction();
            debug!(evicted = %min.key, by = key, "Key evicted from Top-K");
            // receiver gone means nobody is monitoring evictions
            let _ = self.evicted_tx.send(EvictedItem {
                key: min.key.clone(),
                count_at_eviction: max_count,
            });
            result.evicted_key = Some(min.key);
        }
        result
    }

    /// Current Top-K, highest count first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        self.heap.lock().sorted_desc()
    }

    /// Hand out the eviction queue. Only the first caller gets it.
    pub fn take_evicted(&self) -> Option<EvictedQueue> {
        self.evicted_rx.lock().take().map(|rx| EvictedQueue { rx })
    }

    /// Halve every bucket, every candidate and the total.
    pub fn decay(&self) {
        self.sketch.halve();
        let candidates = {
            let mut heap = self.heap.lock();
            heap.halve_all();
            heap.len()
        };
        let mut halved = 0;
        // fetch_update only fails when the closure returns None
        let _ = self.total.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
            halved = t / 2;
            Some(halved)
        });
        metrics::set_detector_stats(halved, candidates);
    }

    /// Sum of observed weights, halved by each decay.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Whether `key` is currently in the Top-K set (no observation recorded).
    #[must_use]
    pub fn is_hot(&self, key: &str) -> bool {
        self.heap.lock().contains(key)
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(k: usize, min_count: u32) -> HotKeyDetector {
        HotKeyDetector::new(HotKeyConfig {
            k,
            width: 1024,
            depth: 4,
            decay: 0.92,
            min_count,
            seed: Some(42),
        })
    }

    #[test]
    fn test_below_threshold_is_not_hot() {
        let d = detector(10, 5);
        for _ in 0..4 {
            assert!(!d.observe("user:1", 1).is_hot);
        }
        assert!(d.observe("user:1", 1).is_hot);
        assert_eq!(d.total(), 5);
    }

    #[test]
    fn test_existing_candidate_stays_hot() {
        let d = detector(2, 1);
        assert!(d.observe("a", 3).is_hot);
        let r = d.observe("a", 1);
        assert!(r.is_hot);
        assert_eq!(r.evicted_key, None);
        assert_eq!(d.snapshot(), vec![("a".to_string(), 4)]);
    }

    #[tokio::test]
    async fn test_full_heap_evicts_minimum() {
        let d = detector(2, 1);
        let mut queue = d.take_evicted().unwrap();
        assert!(d.take_evicted().is_none());

        d.observe("a", 5);
        d.observe("b", 2);
        let r = d.observe("c", 3);

        assert!(r.is_hot);
        assert_eq!(r.evicted_key.as_deref(), Some("b"));
        let item = queue.recv_timeout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(item, EvictedItem { key: "b".into(), count_at_eviction: 3 });
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_weaker_key_not_admitted_when_full() {
        let d = detector(2, 1);
        d.observe("a", 5);
        d.observe("b", 4);
        let r = d.observe("c", 1);
        assert!(!r.is_hot);
        assert_eq!(r.evicted_key, None);
        assert!(!d.is_hot("c"));
    }

    #[test]
    fn test_decay_halves_everything() {
        let d = detector(4, 1);
        d.observe("a", 9);
        d.observe("b", 4);
        d.decay();
        assert_eq!(d.total(), 6);
        assert_eq!(d.snapshot(), vec![("a".to_string(), 4), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let d = detector(2, 1);
        let mut queue = d.take_evicted().unwrap();
        assert!(queue.recv_timeout(Duration::from_millis(5)).await.is_none());
    }
}
