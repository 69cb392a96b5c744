// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends for tests and single-node embedding.
//!
//! [`InMemoryKv`] keeps Redis hash semantics in a `DashMap`. Plain commands are
//! atomic per key; scripts are serialized against each other by a single lock,
//! the same guarantee Redis gives `EVALSHA`. Key TTLs are accepted and ignored.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::scripts::{LedgerTouch, ScriptCall, ScriptOutcome};
use super::traits::{ActorId, AppliedBatch, ItemId, KvStore, LikeBatch, LikeStore, StorageError};

pub struct InMemoryKv {
    data: DashMap<String, HashMap<String, String>>,
    script_lock: Mutex<()>,
}

impl InMemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            script_lock: Mutex::new(()),
        }
    }

    /// Number of keys held
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn field_exists(&self, key: &str, field: &str) -> bool {
        self.data.get(key).is_some_and(|h| h.contains_key(field))
    }

    fn set_field(&self, key: &str, field: &str, value: String) {
        self.data.entry(key.to_string()).or_default().insert(field.to_string(), value);
    }

    /// Remove a field, dropping the key once its hash is empty (as Redis does).
    fn remove_field(&self, key: &str, field: &str) -> Option<String> {
        let removed = self.data.get_mut(key).and_then(|mut h| h.remove(field));
        self.data.remove_if(key, |_, h| h.is_empty());
        removed
    }

    fn incr_field(&self, touch: &LedgerTouch, by: i64) -> Result<(), StorageError> {
        let mut hash = self.data.entry(touch.key.clone()).or_default();
        let current = match hash.get(&touch.field) {
            Some(v) => v.parse::<i64>().map_err(|_| {
                StorageError::Backend(format!("hash value is not an integer: {}", touch.field))
            })?,
            None => 0,
        };
        hash.insert(touch.field.clone(), (current + by).to_string());
        Ok(())
    }

    fn run_script_locked(&self, call: &ScriptCall) -> Result<ScriptOutcome, StorageError> {
        let _guard = self.script_lock.lock();
        match call {
            ScriptCall::Confirm { user_key, item, marker, ledger } => {
                if self.field_exists(user_key, item) {
                    return Ok(ScriptOutcome::Rejected);
                }
                if let Some(touch) = ledger {
                    self.incr_field(touch, 1)?;
                }
                self.set_field(user_key, item, marker.clone());
                Ok(ScriptOutcome::Applied { marker: marker.clone() })
            }
            ScriptCall::Cancel { user_key, item, ledger } => {
                if !self.field_exists(user_key, item) {
                    return Ok(ScriptOutcome::Rejected);
                }
                if let Some(touch) = ledger {
                    self.incr_field(touch, -1)?;
                }
                let marker = self.remove_field(user_key, item).unwrap_or_default();
                Ok(ScriptOutcome::Applied { marker })
            }
            ScriptCall::ReleaseLedger { ledger_key, entries } => {
                let mut released = 0;
                for (field, expected) in entries {
                    let unchanged = self
                        .data
                        .get(ledger_key)
                        .is_some_and(|h| h.get(field) == Some(expected));
                    if unchanged {
                        self.remove_field(ledger_key, field);
                        released += 1;
                    }
                }
                Ok(ScriptOutcome::Released(released))
            }
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.set_field(key, field, value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        Ok(self.remove_field(key, field).is_some())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        Ok(self.field_exists(key, field))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        let hash = self.data.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.as_ref().and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.data.get(key).map(|h| h.value().clone()).unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn run_script(&self, call: &ScriptCall) -> Result<ScriptOutcome, StorageError> {
        self.run_script_locked(call)
    }
}

#[derive(Default)]
struct LikeTables {
    likes: HashSet<(ActorId, ItemId)>,
    counts: HashMap<ItemId, i64>,
}

/// Durable store stand-in. A batch is applied under one lock, so it is all or nothing.
#[derive(Default)]
pub struct InMemoryLikeStore {
    tables: Mutex<LikeTables>,
}

impl InMemoryLikeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of like rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.lock().likes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.lock().likes.is_empty()
    }
}

#[async_trait]
impl LikeStore for InMemoryLikeStore {
    async fn apply_batch(&self, batch: &LikeBatch) -> Result<AppliedBatch, StorageError> {
        let mut tables = self.tables.lock();
        let mut applied = AppliedBatch::default();

        for &(actor, item) in &batch.inserts {
            if tables.likes.insert((actor, item)) {
                *tables.counts.entry(item).or_insert(0) += 1;
                applied.record(item, 1);
            }
        }
        for &(actor, item) in &batch.removals {
            if tables.likes.remove(&(actor, item)) {
                *tables.counts.entry(item).or_insert(0) -= 1;
                applied.record(item, -1);
            }
        }
        Ok(applied)
    }

    async fn liked_items(&self, actor: ActorId) -> Result<HashSet<ItemId>, StorageError> {
        Ok(self
            .tables
            .lock()
            .likes
            .iter()
            .filter(|(a, _)| *a == actor)
            .map(|&(_, item)| item)
            .collect())
    }

    async fn has_like(&self, actor: ActorId, item: ItemId) -> Result<bool, StorageError> {
        Ok(self.tables.lock().likes.contains(&(actor, item)))
    }

    async fn like_count(&self, item: ItemId) -> Result<i64, StorageError> {
        Ok(self.tables.lock().counts.get(&item).copied().unwrap_or(0))
    }
}
