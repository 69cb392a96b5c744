// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Toggle events for the event-driven write mode.
//!
//! # Stream Format
//!
//! ```text
//! XADD {prefix}{stream} [MAXLEN ~ n] *
//!   type     "INCR"
//!   payload  '{"actor_id":7,"item_id":42,"type":"INCR","timestamp":1735776000000}'
//! ```
//!
//! `type` is duplicated outside the payload so the stream can be read by eye;
//! consumers only trust `payload`.

pub mod channel;
pub mod redis_stream;

use serde::{Deserialize, Serialize};

use crate::storage::traits::{ActorId, ItemId, MAX_DURABLE_ID};

pub use channel::{EventChannel, InMemoryChannel};
pub use redis_stream::RedisStreamChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// Like confirmed
    Incr,
    /// Like cancelled
    Decr,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Incr => "INCR",
            EventKind::Decr => "DECR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeEvent {
    pub actor_id: ActorId,
    pub item_id: ItemId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Epoch millis at the toggle
    pub timestamp: i64,
}

impl LikeEvent {
    pub fn incr(actor_id: ActorId, item_id: ItemId, timestamp: i64) -> Self {
        Self { actor_id, item_id, kind: EventKind::Incr, timestamp }
    }

    pub fn decr(actor_id: ActorId, item_id: ItemId, timestamp: i64) -> Self {
        Self { actor_id, item_id, kind: EventKind::Decr, timestamp }
    }

    /// Field-value pairs for `XADD`.
    pub fn to_stream_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        Ok(vec![
            ("type", self.kind.as_str().to_string()),
            ("payload", serde_json::to_string(self)?),
        ])
    }

    /// Parse a stream payload; ids the durable store cannot hold are rejected.
    pub fn from_payload(payload: &str) -> Result<Self, String> {
        let event: Self = serde_json::from_str(payload).map_err(|e| format!("invalid event payload: {}", e))?;
        if event.actor_id > MAX_DURABLE_ID || event.item_id > MAX_DURABLE_ID {
            return Err(format!("event ids out of range: {}/{}", event.actor_id, event.item_id));
        }
        Ok(event)
    }
}

/// One delivered entry. `event` is `Err` when the payload did not parse; such
/// entries are acknowledged and dropped by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub event: Result<LikeEvent, String>,
}
