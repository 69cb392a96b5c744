// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ledger flush.
//!
//! Each run takes every closed slice still staged, oldest first, turns each
//! one's deltas into one [`LikeBatch`], commits it, and only then releases the
//! ledger fields it read. A crash between commit and release means the slice
//! is applied again, which the durable store absorbs because counters only
//! move by rows actually inserted or deleted.
//!
//! Slices must reach the store in the order they were written: a removal
//! applied before the insert it undoes changes nothing, and the insert then
//! lands for good. So a pass stops at the first slice that fails, leaving it
//! and everything newer staged, and passes never overlap. Ids are ordered by
//! age relative to the pass's clock, which keeps `23:59:50` ahead of
//! `00:00:00` across midnight.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::LikeError;
use crate::metrics;
use crate::storage::scripts::{ScriptCall, ScriptOutcome};
use crate::storage::traits::{AppliedBatch, KvStore, LikeBatch, LikeStore, StorageError};
use crate::toggle::keys::{parse_ledger_field, KeySpace};
use crate::toggle::slice::{SliceClock, SliceId};

/// Outcome of flushing one slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Last slice flushed
    pub slice: Option<SliceId>,
    /// Slices flushed
    pub slices: usize,
    /// Ledger fields read
    pub entries: usize,
    /// Fields whose net delta was zero
    pub skipped: usize,
    /// Fields that could not be parsed
    pub malformed: usize,
    pub applied: AppliedBatch,
    /// Ledger fields deleted after commit
    pub released: usize,
}

impl FlushReport {
    /// Fold another slice's report into this one.
    pub fn absorb(&mut self, other: FlushReport) {
        if other.slice.is_some() {
            self.slice = other.slice;
        }
        self.slices += other.slices;
        self.entries += other.entries;
        self.skipped += other.skipped;
        self.malformed += other.malformed;
        self.applied.inserted += other.applied.inserted;
        self.applied.removed += other.applied.removed;
        for (item, delta) in other.applied.count_deltas {
            *self.applied.count_deltas.entry(item).or_insert(0) += delta;
        }
        self.released += other.released;
    }
}

pub struct FlushJob {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn LikeStore>,
    keys: KeySpace,
    clock: SliceClock,
    store_timeout: Duration,
    /// Held for a whole pass so two passes never interleave slices
    pass: Mutex<()>,
}

impl FlushJob {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn LikeStore>,
        keys: KeySpace,
        clock: SliceClock,
        store_timeout: Duration,
    ) -> Self {
        Self { kv, store, keys, clock, store_timeout, pass: Mutex::new(()) }
    }

    pub fn clock(&self) -> SliceClock {
        self.clock
    }

    /// Slices with a ledger key present, oldest first as seen at `now`, plus
    /// the number of ledger keys that did not parse.
    pub async fn staged_slices(&self, now: DateTime<Utc>) -> Result<(Vec<SliceId>, usize), LikeError> {
        let mut slices = Vec::new();
        let mut malformed = 0;
        for key in self.kv.scan_prefix(&self.keys.ledger_prefix()).await? {
            match self.keys.parse_ledger_key(&key) {
                Some(slice) => slices.push(slice),
                None => {
                    warn!(key = %key, "Skipping unparseable ledger key");
                    malformed += 1;
                }
            }
        }
        slices.sort_unstable_by_key(|slice| Reverse(self.clock.age_secs(*slice, now)));
        Ok((slices, malformed))
    }

    /// Flush every staged slice, including the open one.
    pub async fn flush_all(&self) -> Result<FlushReport, LikeError> {
        self.flush_all_at(Utc::now()).await
    }

    pub async fn flush_all_at(&self, now: DateTime<Utc>) -> Result<FlushReport, LikeError> {
        self.flush_staged(now, |_| true).await
    }

    /// Flush every closed slice still staged at `now`: the one that just
    /// closed and any older slice an earlier run could not finish.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<FlushReport, LikeError> {
        let width = self.clock.width_secs();
        self.flush_staged(now, |slice| self.clock.age_secs(slice, now) >= width).await
    }

    /// Flush staged slices that should already have been released at `now`.
    pub async fn flush_overdue(&self, now: DateTime<Utc>) -> Result<FlushReport, LikeError> {
        self.flush_staged(now, |slice| self.clock.is_overdue(slice, now)).await
    }

    async fn flush_staged<P>(&self, now: DateTime<Utc>, wanted: P) -> Result<FlushReport, LikeError>
    where
        P: Fn(SliceId) -> bool,
    {
        let _pass = self.pass.lock().await;
        let (slices, _) = self.staged_slices(now).await?;
        let mut report = FlushReport::default();
        for slice in slices.into_iter().filter(|slice| wanted(*slice)) {
            match self.flush_slice(slice).await {
                Ok(flushed) => report.absorb(flushed),
                Err(e) => {
                    warn!(
                        slice = %slice,
                        flushed = report.slices,
                        error = %e,
                        "Flush pass stopped; this slice and newer ones stay staged"
                    );
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    #[tracing::instrument(skip(self), fields(slice = %slice))]
    async fn flush_slice(&self, slice: SliceId) -> Result<FlushReport, LikeError> {
        let started = Instant::now();
        let ledger_key = self.keys.ledger_key(slice);
        let mut report = FlushReport { slice: Some(slice), slices: 1, ..Default::default() };

        let entries = self.kv.hgetall(&ledger_key).await?;
        if entries.is_empty() {
            debug!(slice = %slice, "Nothing staged");
            return Ok(report);
        }
        report.entries = entries.len();

        let mut batch = LikeBatch::new();
        let mut processed = Vec::with_capacity(entries.len());
        for (field, value) in entries {
            let parsed = parse_ledger_field(&field).zip(value.parse::<i64>().ok());
            match parsed {
                Some(((actor, item), delta)) => {
                    if delta > 0 {
                        batch.inserts.push((actor, item));
                    } else if delta < 0 {
                        batch.removals.push((actor, item));
                    } else {
                        report.skipped += 1;
                    }
                }
                None => {
                    warn!(slice = %slice, field = %field, value = %value, "Malformed ledger entry");
                    report.malformed += 1;
                }
            }
            // malformed fields can never apply, so they are released with the rest
            processed.push((field, value));
        }
        batch.inserts.sort_unstable();
        batch.removals.sort_unstable();
        metrics::record_batch_size("flush", batch.len());
        metrics::record_malformed("flush", report.malformed);

        report.applied = self.apply(&batch).await?;
        metrics::record_rows_applied("flush", report.applied.inserted, report.applied.removed);

        let staged = batch.inserts.len() + batch.removals.len();
        let changed = report.applied.inserted + report.applied.removed;
        if staged != changed {
            // expected when a slice is flushed twice
            warn!(
                slice = %slice,
                staged,
                changed,
                "Durable store absorbed part of the batch as already applied"
            );
        }

        report.released = self.release(&ledger_key, processed).await?;
        metrics::record_ledger_released(report.released);
        metrics::record_job_duration("flush", started.elapsed());

        info!(
            slice = %slice,
            entries = report.entries,
            inserted = report.applied.inserted,
            removed = report.applied.removed,
            skipped = report.skipped,
            malformed = report.malformed,
            released = report.released,
            "Flushed ledger slice"
        );
        Ok(report)
    }

    async fn apply(&self, batch: &LikeBatch) -> Result<AppliedBatch, LikeError> {
        if batch.is_empty() {
            return Ok(AppliedBatch::default());
        }
        match tokio::time::timeout(self.store_timeout, self.store.apply_batch(batch)).await {
            Ok(Ok(applied)) => Ok(applied),
            Ok(Err(e)) => {
                metrics::record_error("flush", "apply", "store");
                Err(e.into())
            }
            Err(_) => {
                metrics::record_timeout("flush", "apply");
                Err(StorageError::Timeout("flush apply_batch".into()).into())
            }
        }
    }

    async fn release(&self, ledger_key: &str, entries: Vec<(String, String)>) -> Result<usize, LikeError> {
        let call = ScriptCall::ReleaseLedger { ledger_key: ledger_key.to_string(), entries };
        match self.kv.run_script(&call).await {
            Ok(ScriptOutcome::Released(n)) => Ok(n),
            Ok(other) => Err(LikeError::Structural(format!("unexpected release outcome {:?}", other))),
            Err(e) => {
                // the batch is committed; a later pass re-applies harmlessly
                warn!(key = %ledger_key, error = %e, "Ledger release failed after commit");
                metrics::record_error("flush", "release", "store");
                Err(e.into())
            }
        }
    }
}
