// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Delivery, LikeEvent};
use crate::storage::traits::StorageError;

/// At-least-once message channel.
///
/// Entries returned by [`poll_batch`](EventChannel::poll_batch) stay pending
/// until acknowledged; pending entries are handed out again on the next poll.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Enqueue an event, returning its entry id.
    async fn publish(&self, event: &LikeEvent) -> Result<String, StorageError>;

    /// Up to `max` entries, waiting at most `wait` when nothing is available.
    async fn poll_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, StorageError>;

    async fn ack(&self, ids: &[String]) -> Result<(), StorageError>;
}

#[derive(Default)]
struct ChannelState {
    next_id: u64,
    queued: VecDeque<(String, LikeEvent)>,
    pending: Vec<(String, LikeEvent)>,
}

/// Process-local channel with the same redelivery rules as a stream consumer group.
#[derive(Default)]
pub struct InMemoryChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl InMemoryChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries never delivered
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Entries delivered but not acknowledged
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn take(&self, max: usize) -> Vec<Delivery> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            let n = max.min(state.queued.len());
            let moved: Vec<_> = state.queued.drain(..n).collect();
            state.pending.extend(moved);
        }
        state
            .pending
            .iter()
            .take(max)
            .map(|(id, event)| Delivery { id: id.clone(), event: Ok(*event) })
            .collect()
    }
}

#[async_trait]
impl EventChannel for InMemoryChannel {
    async fn publish(&self, event: &LikeEvent) -> Result<String, StorageError> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.queued.push_back((id.clone(), *event));
            id
        };
        self.notify.notify_one();
        Ok(id)
    }

    async fn poll_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, StorageError> {
        let batch = self.take(max);
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }
        // a publish between take() and here leaves a permit, so this returns at once
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        Ok(self.take(max))
    }

    async fn ack(&self, ids: &[String]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.pending.retain(|(id, _)| !ids.contains(id));
        Ok(())
    }
}
