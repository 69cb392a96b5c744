// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use super::scripts::{ScriptCall, ScriptOutcome};

/// Actor (user) identifier.
pub type ActorId = u64;

/// Item (blog post) identifier.
pub type ItemId = u64;

/// Largest id the durable store can hold (`BIGINT`).
pub const MAX_DURABLE_ID: u64 = i64::MAX as u64;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage operation '{0}' timed out")]
    Timeout(String),
    #[error("Id {0} does not fit the durable store's signed 64-bit column")]
    IdOutOfRange(u64),
}

impl StorageError {
    /// Whether the same call could succeed later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::IdOutOfRange(_))
    }
}

/// A batch of like facts to apply to the durable store in one transaction.
///
/// Counts are not carried here: the store moves an item's counter only by the
/// rows it actually inserted or deleted, which is what makes re-applying the
/// same batch harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LikeBatch {
    /// (actor, item) facts to insert; duplicates of existing rows are ignored
    pub inserts: Vec<(ActorId, ItemId)>,
    /// (actor, item) facts to delete when present
    pub removals: Vec<(ActorId, ItemId)>,
}

impl LikeBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.removals.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inserts.len() + self.removals.len()
    }
}

/// What a committed [`LikeBatch`] actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Rows newly inserted
    pub inserted: usize,
    /// Rows actually deleted
    pub removed: usize,
    /// Net counter movement per item
    pub count_deltas: BTreeMap<ItemId, i64>,
}

impl AppliedBatch {
    /// Count `delta` rows inserted (positive) or deleted (negative) for `item`.
    pub(crate) fn record(&mut self, item: ItemId, delta: i64) {
        if delta == 0 {
            return;
        }
        let rows = delta.unsigned_abs() as usize;
        if delta > 0 {
            self.inserted += rows;
        } else {
            self.removed += rows;
        }
        *self.count_deltas.entry(item).or_insert(0) += delta;
    }
}

/// Key-value collaborator with Redis hash semantics plus atomic scripts.
///
/// Keys passed in are logical (unprefixed); implementations may namespace them.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError>;
    /// Returns true when the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StorageError>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StorageError>;
    /// One slot per requested field, in order.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StorageError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// All keys starting with `prefix` (cursor based, not atomic).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn del(&self, key: &str) -> Result<(), StorageError>;

    /// Run one of the server-side scripts as a single atomic unit.
    async fn run_script(&self, call: &ScriptCall) -> Result<ScriptOutcome, StorageError>;
}

/// Durable system of record for like facts and per-item counters.
#[async_trait]
pub trait LikeStore: Send + Sync {
    /// Apply inserts, removals and the resulting counter deltas atomically.
    async fn apply_batch(&self, batch: &LikeBatch) -> Result<AppliedBatch, StorageError>;

    /// All items the actor has a durable like for.
    async fn liked_items(&self, actor: ActorId) -> Result<HashSet<ItemId>, StorageError>;

    async fn has_like(&self, actor: ActorId, item: ItemId) -> Result<bool, StorageError>;

    /// Aggregate counter for an item (0 when never liked).
    async fn like_count(&self, item: ItemId) -> Result<i64, StorageError>;
}
