// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request-path API: toggles, lookups, and on-demand jobs.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use crate::error::LikeError;
use crate::jobs::{ConsumeReport, FlushReport, ReconcileReport};
use crate::storage::traits::{ActorId, ItemId};
use crate::toggle::Toggled;

use super::LikeEngine;

impl LikeEngine {
    /// Like `item` on behalf of `actor`.
    ///
    /// # Errors
    /// [`LikeError::Conflict`] when already liked; the other variants per
    /// [`LikeError`].
    pub async fn confirm(&self, actor: ActorId, item: ItemId) -> Result<Toggled, LikeError> {
        self.ensure_accepting()?;
        self.toggles.confirm(actor, item).await
    }

    /// Withdraw a like. [`LikeError::Conflict`] when there is none.
    pub async fn cancel(&self, actor: ActorId, item: ItemId) -> Result<Toggled, LikeError> {
        self.ensure_accepting()?;
        self.toggles.cancel(actor, item).await
    }

    pub async fn has_liked(&self, actor: ActorId, item: ItemId) -> Result<bool, LikeError> {
        self.toggles.has_liked(actor, item).await
    }

    pub async fn liked_among(&self, actor: ActorId, items: &[ItemId]) -> Result<HashMap<ItemId, bool>, LikeError> {
        self.toggles.liked_among(actor, items).await
    }

    /// Durable count for `item`. Lags toggles by up to a flush period (ledger
    /// mode) or a consumer poll (event mode).
    pub async fn like_count(&self, item: ItemId) -> Result<i64, LikeError> {
        Ok(self.store.like_count(item).await?)
    }

    /// Current hot keys, highest count first.
    #[must_use]
    pub fn hot_keys(&self) -> Vec<(String, u32)> {
        self.detector.snapshot()
    }

    /// Flush the slice that just closed, without waiting for the timer.
    pub async fn flush_now(&self) -> Result<FlushReport, LikeError> {
        debug!("On-demand flush");
        self.flush.run_at(Utc::now()).await
    }

    /// Flush every staged slice, the open one included, so durable counts
    /// settle immediately. A no-op in event mode.
    pub async fn flush_all(&self) -> Result<FlushReport, LikeError> {
        if self.consumer.is_some() {
            return Ok(FlushReport::default());
        }
        self.flush.flush_all().await
    }

    pub async fn reconcile_now(&self) -> Result<ReconcileReport, LikeError> {
        self.reconcile.run().await
    }

    /// Process one batch from the event channel (event mode only).
    pub async fn consume_now(&self) -> Result<ConsumeReport, LikeError> {
        match &self.consumer {
            Some(consumer) => consumer.poll_once().await,
            None => Err(LikeError::Structural("no event consumer in ledger mode".into())),
        }
    }

    fn ensure_accepting(&self) -> Result<(), LikeError> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(LikeError::Structural(format!("engine is {}", state)))
        }
    }
}
