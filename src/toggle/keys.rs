// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! KV key layout.
//!
//! ```text
//! {prefix}user:{actor}           hash  item -> marker
//! {prefix}ledger:{HH:MM:SS}      hash  "{actor}:{item}" -> delta
//! {prefix}{stream}               stream of like events (event mode)
//! ```
//!
//! The two families have distinct second segments, so a scan for one never
//! returns keys of the other.

use super::slice::SliceId;
use crate::storage::traits::{ActorId, ItemId, MAX_DURABLE_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn user_key(&self, actor: ActorId) -> String {
        format!("{}user:{}", self.prefix, actor)
    }

    pub fn ledger_key(&self, slice: SliceId) -> String {
        format!("{}ledger:{}", self.prefix, slice)
    }

    pub fn stream_key(&self, stream: &str) -> String {
        format!("{}{}", self.prefix, stream)
    }

    pub fn user_prefix(&self) -> String {
        format!("{}user:", self.prefix)
    }

    pub fn ledger_prefix(&self) -> String {
        format!("{}ledger:", self.prefix)
    }

    pub fn parse_user_key(&self, key: &str) -> Option<ActorId> {
        key.strip_prefix(&self.user_prefix())?.parse().ok()
    }

    pub fn parse_ledger_key(&self, key: &str) -> Option<SliceId> {
        key.strip_prefix(&self.ledger_prefix())?.parse().ok()
    }
}

pub fn ledger_field(actor: ActorId, item: ItemId) -> String {
    format!("{}:{}", actor, item)
}

/// `None` for anything that is not two storable ids joined by `:`.
pub fn parse_ledger_field(field: &str) -> Option<(ActorId, ItemId)> {
    let (actor, item) = field.split_once(':')?;
    let (actor, item): (ActorId, ItemId) = (actor.parse().ok()?, item.parse().ok()?);
    (actor <= MAX_DURABLE_ID && item <= MAX_DURABLE_ID).then_some((actor, item))
}
