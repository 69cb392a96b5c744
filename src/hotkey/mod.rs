// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming Top-K hot-key detection (HeavyKeeper).

pub mod detector;
pub mod heap;
pub mod sketch;

pub use detector::{EvictedItem, EvictedQueue, HotKeyDetector, ObserveResult};

use crate::config::LikeEngineConfig;

/// Detector sizing.
#[derive(Debug, Clone)]
pub struct HotKeyConfig {
    /// Top-K capacity
    pub k: usize,
    pub width: usize,
    pub depth: usize,
    /// Per-unit decay base for colliding buckets, in (0, 1)
    pub decay: f64,
    /// Minimum sketch count before a key can enter the Top-K set
    pub min_count: u32,
    pub seed: Option<u64>,
}

impl Default for HotKeyConfig {
    fn default() -> Self {
        Self::from(&LikeEngineConfig::default())
    }
}

impl From<&LikeEngineConfig> for HotKeyConfig {
    fn from(config: &LikeEngineConfig) -> Self {
        Self {
            k: config.hotkey_k,
            width: config.hotkey_width,
            depth: config.hotkey_depth,
            decay: config.hotkey_decay,
            min_count: config.hotkey_min_count,
            seed: config.hotkey_seed,
        }
    }
}
