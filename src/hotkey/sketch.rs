// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HeavyKeeper count sketch.
//!
//! A `depth × width` grid of `(fingerprint, count)` buckets. Each row hashes
//! the key with its own seed. A bucket owned by another fingerprint is decayed
//! with probability `decay^count` per unit of weight, so cold occupants lose
//! their slot to a hot key while hot occupants are almost never displaced.
//!
//! Every bucket has its own lock and at most one is held at a time.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::Rng;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// Entries in the `decay^i` table; counts above are clamped to the last entry.
pub const DECAY_TABLE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub fingerprint: u64,
    pub count: u32,
}

pub struct Sketch {
    width: usize,
    depth: usize,
    buckets: Vec<Mutex<Bucket>>,
    decay_table: [f64; DECAY_TABLE_SIZE],
}

/// Key identity stored in buckets.
#[inline]
pub fn fingerprint(key: &[u8]) -> u64 {
    xxh3_64(key)
}

impl Sketch {
    pub fn new(width: usize, depth: usize, decay: f64) -> Self {
        let width = width.max(1);
        let depth = depth.max(1);

        let mut decay_table = [0.0; DECAY_TABLE_SIZE];
        for (i, slot) in decay_table.iter_mut().enumerate() {
            *slot = decay.powi(i as i32);
        }

        Self {
            width,
            depth,
            buckets: (0..width * depth).map(|_| Mutex::new(Bucket::default())).collect(),
            decay_table,
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    fn slot(&self, row: usize, key: &[u8]) -> usize {
        let column = (xxh3_64_with_seed(key, row as u64) % self.width as u64) as usize;
        row * self.width + column
    }

    #[inline]
    fn decay_probability(&self, count: u32) -> f64 {
        self.decay_table[(count as usize).min(DECAY_TABLE_SIZE - 1)]
    }

    /// Add `weight` for `key` in every row; returns the largest count this key
    /// now owns in any row (0 if it owns none).
    pub fn add(&self, key: &[u8], weight: u32, rng: &mut SmallRng) -> u32 {
        let fp = fingerprint(key);
        let mut max_count = 0u32;

        for row in 0..self.depth {
            let mut bucket = self.buckets[self.slot(row, key)].lock();

            if bucket.count == 0 {
                bucket.fingerprint = fp;
                bucket.count = weight;
                max_count = max_count.max(bucket.count);
            } else if bucket.fingerprint == fp {
                bucket.count = bucket.count.saturating_add(weight);
                max_count = max_count.max(bucket.count);
            } else {
                for j in 0..weight {
                    if rng.gen::<f64>() < self.decay_probability(bucket.count) {
                        bucket.count -= 1;
                        if bucket.count == 0 {
                            bucket.fingerprint = fp;
                            bucket.count = weight - j;
                            max_count = max_count.max(bucket.count);
                            break;
                        }
                    }
                }
            }
        }

        max_count
    }

    /// Halve every bucket (integer division, rounds toward zero).
    pub fn halve(&self) {
        for bucket in &self.buckets {
            let mut b = bucket.lock();
            b.count >>= 1;
        }
    }

    /// Largest count owned by `key` without modifying anything.
    #[must_use]
    pub fn estimate(&self, key: &[u8]) -> u32 {
        let fp = fingerprint(key);
        (0..self.depth)
            .filter_map(|row| {
                let b = self.buckets[self.slot(row, key)].lock();
                (b.fingerprint == fp && b.count > 0).then_some(b.count)
            })
            .max()
            .unwrap_or(0)
    }
}
