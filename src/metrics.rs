// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for like-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `like_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: toggle, detector, cache, flush, reconcile, consumer
//! - `operation`: confirm, cancel, get, apply, publish
//! - `tier`: local, kv (cache lookups)
//! - `outcome`: applied, conflict, error, publish_failed, hit, miss

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of a toggle (`confirm` / `cancel`)
pub fn record_toggle(operation: &str, outcome: &str) {
    counter!(
        "like_engine_toggles_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "like_engine_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// DETECTOR - Top-K admission and eviction
// ═══════════════════════════════════════════════════════════════════════════

/// A key entered the Top-K set
pub fn record_hot_admission() {
    counter!("like_engine_hotkey_admissions_total").increment(1);
}

/// A key was pushed out of the Top-K set
pub fn record_hot_eviction() {
    counter!("like_engine_hotkey_evictions_total").increment(1);
}

/// Set detector totals after a decay pass
pub fn set_detector_stats(total: u64, candidates: usize) {
    gauge!("like_engine_hotkey_total_weight").set(total as f64);
    gauge!("like_engine_hotkey_candidates").set(candidates as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Tiered lookups
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup on a tier
pub fn record_cache_lookup(tier: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "like_engine_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Entries demoted from the local tier after a Top-K eviction
pub fn record_cache_demotions(count: usize) {
    counter!("like_engine_cache_demotions_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// JOBS - Flush, reconcile, consume
// ═══════════════════════════════════════════════════════════════════════════

/// Record batch size handed to the durable store
pub fn record_batch_size(component: &str, count: usize) {
    histogram!(
        "like_engine_batch_size",
        "component" => component.to_string()
    )
    .record(count as f64);
}

/// Record rows that actually changed in the durable store
pub fn record_rows_applied(component: &str, inserted: usize, removed: usize) {
    counter!(
        "like_engine_rows_inserted_total",
        "component" => component.to_string()
    )
    .increment(inserted as u64);
    counter!(
        "like_engine_rows_removed_total",
        "component" => component.to_string()
    )
    .increment(removed as u64);
}

/// Ledger entries removed after a committed flush
pub fn record_ledger_released(count: usize) {
    counter!("like_engine_ledger_released_total").increment(count as u64);
}

/// Record entries skipped because their key or value did not parse
pub fn record_malformed(component: &str, count: usize) {
    counter!(
        "like_engine_malformed_entries_total",
        "component" => component.to_string()
    )
    .increment(count as u64);
}

/// Synthetic events emitted by reconciliation
pub fn record_repairs(count: usize) {
    counter!("like_engine_reconcile_repairs_total").increment(count as u64);
}

/// Record events through the channel (`published`, `consumed`, `discarded`)
pub fn record_events(op: &str, count: usize) {
    counter!(
        "like_engine_events_total",
        "op" => op.to_string()
    )
    .increment(count as u64);
}

/// Record a job run duration
pub fn record_job_duration(job: &str, duration: Duration) {
    histogram!(
        "like_engine_job_seconds",
        "job" => job.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "like_engine_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a timeout error
pub fn record_timeout(component: &str, operation: &str) {
    counter!(
        "like_engine_timeouts_total",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "like_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "like_engine_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
