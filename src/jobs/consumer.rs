// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent batch consumer for the event write mode.
//!
//! A polled batch is grouped by (actor, item). Within a group, events are
//! ordered by timestamp; a group with an even number of events is taken to
//! cancel out and is dropped, an odd group applies its last event's kind.
//! The whole batch is then applied in one durable transaction and only
//! acknowledged after that commits, so a failure leaves it pending for
//! redelivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LikeError;
use crate::events::{Delivery, EventChannel, EventKind, LikeEvent};
use crate::metrics;
use crate::storage::traits::{ActorId, AppliedBatch, ItemId, LikeBatch, LikeStore, StorageError};

/// Pause after a failed poll or apply before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub delivered: usize,
    pub malformed: usize,
    /// Groups dropped by the even-count rule
    pub discarded_groups: usize,
    pub applied: AppliedBatch,
}

/// Collapse a batch of events into the facts to apply.
pub fn collapse(events: &[LikeEvent]) -> (LikeBatch, usize) {
    let mut groups: HashMap<(ActorId, ItemId), Vec<&LikeEvent>> = HashMap::new();
    for event in events {
        groups.entry((event.actor_id, event.item_id)).or_default().push(event);
    }

    let mut batch = LikeBatch::new();
    let mut discarded = 0;
    for (pair, mut group) in groups {
        if group.len() % 2 == 0 {
            discarded += 1;
            continue;
        }
        // stable: equal timestamps keep arrival order
        group.sort_by_key(|e| e.timestamp);
        match group.last().map(|e| e.kind) {
            Some(EventKind::Incr) => batch.inserts.push(pair),
            Some(EventKind::Decr) => batch.removals.push(pair),
            None => {}
        }
    }
    batch.inserts.sort_unstable();
    batch.removals.sort_unstable();
    (batch, discarded)
}

pub struct BatchConsumer {
    channel: Arc<dyn EventChannel>,
    store: Arc<dyn LikeStore>,
    batch_size: usize,
    poll_wait: Duration,
    store_timeout: Duration,
}

impl BatchConsumer {
    pub fn new(
        channel: Arc<dyn EventChannel>,
        store: Arc<dyn LikeStore>,
        batch_size: usize,
        poll_wait: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self { channel, store, batch_size, poll_wait, store_timeout }
    }

    /// Poll once and process whatever arrived.
    pub async fn poll_once(&self) -> Result<ConsumeReport, LikeError> {
        let deliveries = self.channel.poll_batch(self.batch_size, self.poll_wait).await?;
        self.process(deliveries).await
    }

    /// Apply one delivered batch and acknowledge it.
    #[tracing::instrument(skip_all, fields(delivered = deliveries.len()))]
    pub async fn process(&self, deliveries: Vec<Delivery>) -> Result<ConsumeReport, LikeError> {
        let mut report = ConsumeReport { delivered: deliveries.len(), ..Default::default() };
        if deliveries.is_empty() {
            return Ok(report);
        }
        let started = Instant::now();

        let mut ids = Vec::with_capacity(deliveries.len());
        let mut events = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match delivery.event {
                Ok(event) => events.push(event),
                Err(reason) => {
                    warn!(id = %delivery.id, reason = %reason, "Dropping malformed event");
                    report.malformed += 1;
                }
            }
            ids.push(delivery.id);
        }
        metrics::record_malformed("consumer", report.malformed);
        metrics::record_events("consumed", events.len());

        let (batch, discarded) = collapse(&events);
        report.discarded_groups = discarded;
        metrics::record_batch_size("consumer", batch.len());

        if !batch.is_empty() {
            report.applied = match tokio::time::timeout(self.store_timeout, self.store.apply_batch(&batch)).await {
                Ok(Ok(applied)) => applied,
                Ok(Err(e)) => {
                    metrics::record_error("consumer", "apply", "store");
                    return Err(e.into());
                }
                Err(_) => {
                    metrics::record_timeout("consumer", "apply");
                    return Err(StorageError::Timeout("consumer apply_batch".into()).into());
                }
            };
            metrics::record_rows_applied("consumer", report.applied.inserted, report.applied.removed);
        }

        // committed; a failed ack only means the batch is seen again
        self.channel.ack(&ids).await?;
        metrics::record_job_duration("consumer", started.elapsed());

        debug!(
            delivered = report.delivered,
            inserted = report.applied.inserted,
            removed = report.applied.removed,
            discarded = report.discarded_groups,
            "Consumed event batch"
        );
        Ok(report)
    }

    /// Consume until `shutdown` flips to true. A batch that has been received
    /// is always processed before the loop checks for shutdown again.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.batch_size, "Batch consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                polled = self.channel.poll_batch(self.batch_size, self.poll_wait) => polled,
                _ = shutdown.changed() => break,
            };

            let outcome = match polled {
                Ok(deliveries) => self.process(deliveries).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "Consumer iteration failed; batch stays pending");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!("Batch consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryChannel;
    use crate::storage::memory::InMemoryLikeStore;

    #[test]
    fn test_collapse_rules() {
        let events = vec![
            // (1,10): INCR DECR INCR -> insert
            LikeEvent::incr(1, 10, 1),
            LikeEvent::decr(1, 10, 2),
            LikeEvent::incr(1, 10, 3),
            // (2,10): INCR DECR -> discarded
            LikeEvent::incr(2, 10, 1),
            LikeEvent::decr(2, 10, 2),
            // (3,10): single DECR -> removal
            LikeEvent::decr(3, 10, 5),
        ];
        let (batch, discarded) = collapse(&events);
        assert_eq!(batch.inserts, vec![(1, 10)]);
        assert_eq!(batch.removals, vec![(3, 10)]);
        assert_eq!(discarded, 1);
    }

    #[test]
    fn test_collapse_orders_by_timestamp() {
        // arrival order differs from timestamp order; the latest is a DECR
        let events = vec![
            LikeEvent::decr(1, 10, 30),
            LikeEvent::incr(1, 10, 10),
            LikeEvent::incr(1, 10, 20),
        ];
        let (batch, _) = collapse(&events);
        assert_eq!(batch.removals, vec![(1, 10)]);
        assert!(batch.inserts.is_empty());
    }

    #[tokio::test]
    async fn test_poll_apply_ack() {
        let channel = Arc::new(InMemoryChannel::new());
        let store = Arc::new(InMemoryLikeStore::new());
        let consumer = BatchConsumer::new(channel.clone(), store.clone(), 100, Duration::ZERO, Duration::from_secs(1));

        channel.publish(&LikeEvent::incr(1, 10, 1)).await.unwrap();
        channel.publish(&LikeEvent::incr(2, 10, 1)).await.unwrap();

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.applied.inserted, 2);
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(store.like_count(10).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_idempotent() {
        let channel = Arc::new(InMemoryChannel::new());
        let store = Arc::new(InMemoryLikeStore::new());
        let consumer = BatchConsumer::new(channel.clone(), store.clone(), 100, Duration::ZERO, Duration::from_secs(1));

        let deliveries = vec![Delivery { id: "1-0".into(), event: Ok(LikeEvent::incr(1, 10, 1)) }];
        consumer.process(deliveries.clone()).await.unwrap();
        let again = consumer.process(deliveries).await.unwrap();

        assert_eq!(again.applied.inserted, 0);
        assert_eq!(store.like_count(10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_acked_and_skipped() {
        let channel = Arc::new(InMemoryChannel::new());
        let store = Arc::new(InMemoryLikeStore::new());
        let consumer = BatchConsumer::new(channel, store.clone(), 100, Duration::ZERO, Duration::from_secs(1));

        let report = consumer
            .process(vec![
                Delivery { id: "1-0".into(), event: Err("bad".into()) },
                Delivery { id: "2-0".into(), event: Ok(LikeEvent::incr(1, 10, 1)) },
            ])
            .await
            .unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(store.like_count(10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let channel = Arc::new(InMemoryChannel::new());
        let store = Arc::new(InMemoryLikeStore::new());
        let consumer = Arc::new(BatchConsumer::new(
            channel.clone(),
            store.clone(),
            100,
            Duration::from_millis(50),
            Duration::from_secs(1),
        ));
        let (tx, rx) = watch::channel(false);

        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        channel.publish(&LikeEvent::incr(1, 10, 1)).await.unwrap();
        for _ in 0..100 {
            if store.like_count(10).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.like_count(10).await.unwrap(), 1);
    }
}
