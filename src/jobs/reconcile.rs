// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drift repair between UserState and the durable store.
//!
//! - Event mode: for every actor, items present in UserState but missing from
//!   the durable store get a synthetic INCR event. An INCR still in flight for
//!   the same pair produces a duplicate, which the consumer absorbs.
//! - Ledger mode: any slice key still present once it is overdue (its flush
//!   should have released it) is flushed again, oldest first, stopping at the
//!   first failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::flush::{FlushJob, FlushReport};
use crate::config::WriteMode;
use crate::error::LikeError;
use crate::events::{EventChannel, LikeEvent};
use crate::metrics;
use crate::storage::traits::{ActorId, ItemId, KvStore, LikeStore, StorageError};
use crate::toggle::keys::KeySpace;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// User or ledger keys visited
    pub scanned: usize,
    /// Synthetic INCR events published
    pub repaired: usize,
    /// Markers left alone because they are inside the grace window
    pub deferred: usize,
    pub malformed: usize,
    /// Keys that failed and were skipped this run
    pub failed: usize,
    /// Combined result of re-flushed slices
    pub flushed: FlushReport,
    pub slices_flushed: usize,
}

pub struct ReconcileJob {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn LikeStore>,
    channel: Option<Arc<dyn EventChannel>>,
    flush: Arc<FlushJob>,
    keys: KeySpace,
    mode: WriteMode,
    grace: Duration,
    store_timeout: Duration,
}

impl ReconcileJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn LikeStore>,
        channel: Option<Arc<dyn EventChannel>>,
        flush: Arc<FlushJob>,
        keys: KeySpace,
        mode: WriteMode,
        grace: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self { kv, store, channel, flush, keys, mode, grace, store_timeout }
    }

    pub async fn run(&self) -> Result<ReconcileReport, LikeError> {
        self.run_at(Utc::now()).await
    }

    #[tracing::instrument(skip(self, now), fields(mode = ?self.mode))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport, LikeError> {
        let started = Instant::now();
        let report = match self.mode {
            WriteMode::Event => self.repair_user_state(now).await?,
            WriteMode::Ledger => self.flush_overdue(now).await?,
        };
        metrics::record_job_duration("reconcile", started.elapsed());
        metrics::record_repairs(report.repaired);
        metrics::record_malformed("reconcile", report.malformed);

        info!(
            scanned = report.scanned,
            repaired = report.repaired,
            deferred = report.deferred,
            slices_flushed = report.slices_flushed,
            failed = report.failed,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn repair_user_state(&self, now: DateTime<Utc>) -> Result<ReconcileReport, LikeError> {
        let Some(channel) = &self.channel else {
            return Err(LikeError::Structural("event reconciliation needs an event channel".into()));
        };
        let mut report = ReconcileReport::default();
        let now_ms = now.timestamp_millis();
        let grace_ms = i64::try_from(self.grace.as_millis()).unwrap_or(i64::MAX);

        for key in self.kv.scan_prefix(&self.keys.user_prefix()).await? {
            report.scanned += 1;
            let Some(actor) = self.keys.parse_user_key(&key) else {
                warn!(key = %key, "Skipping unparseable user key");
                report.malformed += 1;
                continue;
            };

            let missing = match self.missing_for(&key, actor, now_ms, grace_ms, &mut report).await {
                Ok(missing) => missing,
                Err(e) => {
                    warn!(actor, error = %e, "Could not diff actor; continuing");
                    metrics::record_error("reconcile", "diff", "store");
                    report.failed += 1;
                    continue;
                }
            };

            for item in missing {
                let event = LikeEvent::incr(actor, item, now_ms);
                match channel.publish(&event).await {
                    Ok(_) => {
                        debug!(actor, item, "Published compensating INCR");
                        report.repaired += 1;
                    }
                    Err(e) => {
                        warn!(actor, item, error = %e, "Compensating publish failed");
                        metrics::record_error("reconcile", "publish", "channel");
                        report.failed += 1;
                    }
                }
            }
        }
        metrics::record_events("repair", report.repaired);
        Ok(report)
    }

    /// Items liked in UserState, old enough to be trusted, with no durable row.
    async fn missing_for(
        &self,
        key: &str,
        actor: ActorId,
        now_ms: i64,
        grace_ms: i64,
        report: &mut ReconcileReport,
    ) -> Result<Vec<ItemId>, StorageError> {
        let state = self.kv.hgetall(key).await?;
        if state.is_empty() {
            return Ok(Vec::new());
        }
        let durable: HashSet<ItemId> =
            match tokio::time::timeout(self.store_timeout, self.store.liked_items(actor)).await {
                Ok(result) => result?,
                Err(_) => {
                    metrics::record_timeout("reconcile", "liked_items");
                    return Err(StorageError::Timeout("reconcile liked_items".into()));
                }
            };

        let mut missing = Vec::new();
        for (field, marker) in state {
            let Ok(item) = field.parse::<ItemId>() else {
                warn!(key = %key, field = %field, "Skipping unparseable item field");
                report.malformed += 1;
                continue;
            };
            if durable.contains(&item) {
                continue;
            }
            let young = marker
                .parse::<i64>()
                .is_ok_and(|at| now_ms.saturating_sub(at) < grace_ms);
            if young {
                report.deferred += 1;
                continue;
            }
            missing.push(item);
        }
        missing.sort_unstable();
        Ok(missing)
    }

    async fn flush_overdue(&self, now: DateTime<Utc>) -> Result<ReconcileReport, LikeError> {
        let mut report = ReconcileReport::default();

        let (slices, malformed) = self.flush.staged_slices(now).await?;
        report.scanned = slices.len() + malformed;
        report.malformed = malformed;

        let clock = self.flush.clock();
        if !slices.iter().any(|slice| clock.is_overdue(*slice, now)) {
            return Ok(report);
        }
        match self.flush.flush_overdue(now).await {
            Ok(flushed) => {
                report.slices_flushed = flushed.slices;
                report.flushed = flushed;
            }
            Err(e) => {
                warn!(error = %e, "Re-flush stopped; remaining slices wait for the next run");
                report.failed += 1;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryChannel;
    use crate::storage::memory::{InMemoryKv, InMemoryLikeStore};
    use crate::storage::traits::LikeBatch;
    use crate::toggle::slice::SliceClock;
    use chrono::TimeZone;

    struct Fixture {
        kv: Arc<InMemoryKv>,
        store: Arc<InMemoryLikeStore>,
        channel: Arc<InMemoryChannel>,
    }

    fn reconciler(mode: WriteMode, grace: Duration) -> (ReconcileJob, Fixture) {
        let kv = Arc::new(InMemoryKv::new());
        let store = Arc::new(InMemoryLikeStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let keys = KeySpace::new("like:");
        let flush = Arc::new(FlushJob::new(
            kv.clone(),
            store.clone(),
            keys.clone(),
            SliceClock::new(10),
            Duration::from_secs(1),
        ));
        let job = ReconcileJob::new(
            kv.clone(),
            store.clone(),
            Some(channel.clone()),
            flush,
            keys,
            mode,
            grace,
            Duration::from_secs(1),
        );
        (job, Fixture { kv, store, channel })
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_zero_drift_emits_nothing() {
        let (job, fx) = reconciler(WriteMode::Event, Duration::ZERO);
        fx.kv.hset("like:user:1", "10", "1").await.unwrap();
        fx.store.apply_batch(&LikeBatch { inserts: vec![(1, 10)], removals: vec![] }).await.unwrap();

        let report = job.run_at(noon()).await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(fx.channel.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_missing_durable_like_is_republished() {
        let (job, fx) = reconciler(WriteMode::Event, Duration::ZERO);
        fx.kv.hset("like:user:1", "10", "1").await.unwrap();
        fx.kv.hset("like:user:1", "11", "1").await.unwrap();
        fx.store.apply_batch(&LikeBatch { inserts: vec![(1, 10)], removals: vec![] }).await.unwrap();

        let report = job.run_at(noon()).await.unwrap();
        assert_eq!(report.repaired, 1);

        let delivered = fx.channel.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(delivered.len(), 1);
        let event = delivered[0].event.clone().unwrap();
        assert_eq!((event.actor_id, event.item_id), (1, 11));
    }

    #[tokio::test]
    async fn test_grace_window_defers_young_markers() {
        let (job, fx) = reconciler(WriteMode::Event, Duration::from_secs(60));
        let now = noon();
        let young = (now.timestamp_millis() - 5_000).to_string();
        let old = (now.timestamp_millis() - 120_000).to_string();
        fx.kv.hset("like:user:1", "10", &young).await.unwrap();
        fx.kv.hset("like:user:1", "11", &old).await.unwrap();

        let report = job.run_at(now).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.repaired, 1);
    }

    #[tokio::test]
    async fn test_ledger_mode_reflushes_overdue_slices_only() {
        let (job, fx) = reconciler(WriteMode::Ledger, Duration::ZERO);
        // 11:59:30 is overdue at noon, 11:59:50 is the previous slice
        fx.kv.hset("like:ledger:11:59:30", "1:10", "1").await.unwrap();
        fx.kv.hset("like:ledger:11:59:50", "2:10", "1").await.unwrap();

        let report = job.run_at(noon()).await.unwrap();

        assert_eq!(report.slices_flushed, 1);
        assert_eq!(report.flushed.applied.inserted, 1);
        assert_eq!(fx.store.like_count(10).await.unwrap(), 1);
        assert!(fx.kv.hexists("like:ledger:11:59:50", "2:10").await.unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_keys_are_counted() {
        let (job, fx) = reconciler(WriteMode::Event, Duration::ZERO);
        fx.kv.hset("like:user:abc", "10", "1").await.unwrap();
        fx.kv.hset("like:user:2", "x", "1").await.unwrap();

        let report = job.run_at(noon()).await.unwrap();
        assert_eq!(report.malformed, 2);
        assert_eq!(report.repaired, 0);
    }

    #[tokio::test]
    async fn test_ledger_reflush_keeps_order_across_midnight() {
        let (job, fx) = reconciler(WriteMode::Ledger, Duration::ZERO);
        fx.kv.hset("like:ledger:23:59:50", "1:10", "1").await.unwrap();
        fx.kv.hset("like:ledger:00:00:00", "1:10", "-1").await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 25).unwrap();
        let report = job.run_at(now).await.unwrap();

        assert_eq!(report.slices_flushed, 2);
        assert_eq!(fx.store.like_count(10).await.unwrap(), 0);
        assert!(!fx.store.has_like(1, 10).await.unwrap());
    }
}
