// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Like / unlike state machine.
//!
//! Per (actor, item) the state is binary: `Absent ⇄ Liked`. Each transition is
//! one server-side script that checks UserState and writes it, plus the
//! current slice's ledger delta in ledger mode. Nothing here takes a
//! process-local lock; two instances toggling the same pair serialize inside
//! the KV store.
//!
//! In event mode the script touches UserState only and the toggle then
//! publishes a [`LikeEvent`]. If publishing fails the UserState change is
//! undone with the opposite script and [`LikeError::PublishFailure`] is
//! returned.
//!
//! Hot actors (per the detector) get their confirmed markers admitted to the
//! local cache tier, and a repeated confirm for a marker already there is
//! rejected without a round trip.

pub mod keys;
pub mod slice;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cache::TieredCache;
use crate::config::{LikeEngineConfig, WriteMode};
use crate::error::LikeError;
use crate::events::{EventChannel, LikeEvent};
use crate::metrics::{self, LatencyTimer};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::scripts::{LedgerTouch, ScriptCall, ScriptOutcome};
use crate::storage::traits::{ActorId, ItemId, KvStore, MAX_DURABLE_ID};

use keys::{ledger_field, KeySpace};
use slice::{SliceClock, SliceId};

/// A transition that went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toggled {
    /// Ledger slice the delta landed in (ledger mode only)
    pub slice: Option<SliceId>,
    /// Marker written by a confirm, or removed by a cancel
    pub marker: String,
}

pub struct ToggleService {
    kv: Arc<dyn KvStore>,
    cache: Arc<TieredCache>,
    channel: Option<Arc<dyn EventChannel>>,
    keys: KeySpace,
    clock: SliceClock,
    mode: WriteMode,
    ledger_ttl_secs: u64,
    retry: Option<RetryConfig>,
}

impl ToggleService {
    /// `channel` is required in [`WriteMode::Event`].
    pub fn new(
        config: &LikeEngineConfig,
        kv: Arc<dyn KvStore>,
        cache: Arc<TieredCache>,
        channel: Option<Arc<dyn EventChannel>>,
    ) -> Result<Self, LikeError> {
        if config.write_mode == WriteMode::Event && channel.is_none() {
            return Err(LikeError::Structural("event write mode needs an event channel".into()));
        }
        Ok(Self {
            kv,
            cache,
            channel,
            keys: KeySpace::new(config.key_prefix.clone()),
            clock: SliceClock::new(config.slice_secs),
            mode: config.write_mode,
            ledger_ttl_secs: config.ledger_ttl_secs,
            retry: config.retry_toggles.then(RetryConfig::toggle),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn clock(&self) -> SliceClock {
        self.clock
    }

    /// Absent → Liked.
    pub async fn confirm(&self, actor: ActorId, item: ItemId) -> Result<Toggled, LikeError> {
        self.confirm_at(actor, item, Utc::now()).await
    }

    /// Liked → Absent.
    pub async fn cancel(&self, actor: ActorId, item: ItemId) -> Result<Toggled, LikeError> {
        self.cancel_at(actor, item, Utc::now()).await
    }

    /// [`confirm`](Self::confirm) with an explicit clock reading.
    #[tracing::instrument(skip(self, now))]
    pub async fn confirm_at(&self, actor: ActorId, item: ItemId, now: DateTime<Utc>) -> Result<Toggled, LikeError> {
        let _timer = LatencyTimer::new("toggle", "confirm");
        check_ids(actor, item)?;
        let user_key = self.keys.user_key(actor);
        let field = item.to_string();

        let hot = self.cache.detector().observe(&user_key, 1).is_hot;
        if hot && self.cache.get_local(&user_key, &field).is_some() {
            debug!(actor, item, "Duplicate confirm from hot actor rejected locally");
            metrics::record_toggle("confirm", "conflict");
            return Err(LikeError::Conflict("already liked"));
        }

        let marker = now.timestamp_millis().to_string();
        let (slice, ledger) = self.ledger_touch(actor, item, now);
        let call = ScriptCall::Confirm {
            user_key: user_key.clone(),
            item: field.clone(),
            marker,
            ledger,
        };

        let marker = match self.run(&call, "confirm").await? {
            ScriptOutcome::Applied { marker } => marker,
            _ => {
                metrics::record_toggle("confirm", "conflict");
                return Err(LikeError::Conflict("already liked"));
            }
        };

        if self.mode == WriteMode::Event {
            let event = LikeEvent::incr(actor, item, now.timestamp_millis());
            let undo = ScriptCall::Cancel { user_key: user_key.clone(), item: field.clone(), ledger: None };
            self.publish_or_compensate("confirm", &event, &undo).await?;
        }

        if hot {
            self.cache.admit(&user_key, &field, &marker);
        } else {
            self.cache.put_if_present(&user_key, &field, &marker);
        }
        metrics::record_toggle("confirm", "applied");
        Ok(Toggled { slice, marker })
    }

    /// [`cancel`](Self::cancel) with an explicit clock reading.
    #[tracing::instrument(skip(self, now))]
    pub async fn cancel_at(&self, actor: ActorId, item: ItemId, now: DateTime<Utc>) -> Result<Toggled, LikeError> {
        let _timer = LatencyTimer::new("toggle", "cancel");
        check_ids(actor, item)?;
        let user_key = self.keys.user_key(actor);
        let field = item.to_string();

        self.cache.detector().observe(&user_key, 1);

        let (slice, ledger) = self.ledger_touch(actor, item, now);
        let call = ScriptCall::Cancel { user_key: user_key.clone(), item: field.clone(), ledger };

        let marker = match self.run(&call, "cancel").await? {
            ScriptOutcome::Applied { marker } => marker,
            _ => {
                metrics::record_toggle("cancel", "conflict");
                return Err(LikeError::Conflict("not liked"));
            }
        };
        self.cache.invalidate(&user_key, &field);

        if self.mode == WriteMode::Event {
            let event = LikeEvent::decr(actor, item, now.timestamp_millis());
            let undo = ScriptCall::Confirm {
                user_key: user_key.clone(),
                item: field.clone(),
                marker: marker.clone(),
                ledger: None,
            };
            self.publish_or_compensate("cancel", &event, &undo).await?;
        }

        metrics::record_toggle("cancel", "applied");
        Ok(Toggled { slice, marker })
    }

    /// Whether the actor currently likes the item, through the tiered cache.
    pub async fn has_liked(&self, actor: ActorId, item: ItemId) -> Result<bool, LikeError> {
        let found = self
            .cache
            .get(&self.keys.user_key(actor), &item.to_string())
            .await?;
        Ok(found.is_some())
    }

    /// Liked flag for each of `items` in one `HMGET`.
    pub async fn liked_among(&self, actor: ActorId, items: &[ItemId]) -> Result<HashMap<ItemId, bool>, LikeError> {
        let fields: Vec<String> = items.iter().map(ToString::to_string).collect();
        let values = self.kv.hmget(&self.keys.user_key(actor), &fields).await?;
        Ok(items
            .iter()
            .zip(values)
            .map(|(&item, value)| (item, value.is_some()))
            .collect())
    }

    fn ledger_touch(&self, actor: ActorId, item: ItemId, now: DateTime<Utc>) -> (Option<SliceId>, Option<LedgerTouch>) {
        if self.mode != WriteMode::Ledger {
            return (None, None);
        }
        let slice = self.clock.slice_at(now);
        let touch = LedgerTouch {
            key: self.keys.ledger_key(slice),
            field: ledger_field(actor, item),
            ttl_secs: self.ledger_ttl_secs,
        };
        (Some(slice), Some(touch))
    }

    async fn run(&self, call: &ScriptCall, op: &'static str) -> Result<ScriptOutcome, LikeError> {
        let result = match &self.retry {
            Some(config) => {
                retry_if(call.name(), config, LikeError::is_transient, || async {
                    self.kv.run_script(call).await.map_err(LikeError::from)
                })
                .await
            }
            None => self.kv.run_script(call).await.map_err(LikeError::from),
        };
        if let Err(e) = &result {
            metrics::record_toggle(op, "error");
            metrics::record_error("toggle", op, "store");
            warn!(op, script = call.name(), error = %e, "Toggle script failed");
        }
        result
    }

    async fn publish_or_compensate(&self, op: &'static str, event: &LikeEvent, undo: &ScriptCall) -> Result<(), LikeError> {
        let Some(channel) = &self.channel else {
            return Err(LikeError::Structural("event write mode needs an event channel".into()));
        };
        let Err(publish_err) = channel.publish(event).await else {
            metrics::record_events("published", 1);
            return Ok(());
        };

        metrics::record_toggle(op, "publish_failed");
        let compensated = match self.kv.run_script(undo).await {
            Ok(ScriptOutcome::Applied { .. }) => true,
            Ok(_) => {
                // someone toggled the pair back in the meantime
                warn!(op, actor = event.actor_id, item = event.item_id, "Compensation found state already reverted");
                true
            }
            Err(e) => {
                warn!(op, actor = event.actor_id, item = event.item_id, error = %e,
                    "Compensation failed; reconciliation will repair UserState drift");
                false
            }
        };
        Err(LikeError::PublishFailure { reason: publish_err.to_string(), compensated })
    }
}

/// Ids above [`MAX_DURABLE_ID`] could be staged but never flushed.
fn check_ids(actor: ActorId, item: ItemId) -> Result<(), LikeError> {
    if actor > MAX_DURABLE_ID || item > MAX_DURABLE_ID {
        return Err(LikeError::Structural(format!(
            "actor {} / item {} outside the storable id range (max {})",
            actor, item, MAX_DURABLE_ID
        )));
    }
    Ok(())
}
