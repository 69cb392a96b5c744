// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for durable like facts and per-item counters.
//!
//! Schema:
//! ```sql
//! CREATE TABLE item_likes (
//!   actor_id   BIGINT NOT NULL,
//!   item_id    BIGINT NOT NULL,
//!   created_at BIGINT NOT NULL,      -- epoch millis
//!   UNIQUE (actor_id, item_id)
//! )
//! CREATE TABLE item_like_counts (
//!   item_id    BIGINT PRIMARY KEY,
//!   like_count BIGINT NOT NULL
//! )
//! ```
//!
//! ## Idempotent batch apply
//!
//! A [`LikeBatch`] runs in one transaction. Facts are grouped by item: each
//! item gets one multi-row `INSERT OR IGNORE` (`INSERT IGNORE` on MySQL) and
//! one `DELETE .. actor_id IN (..)`, and its counter moves by the rows those
//! statements actually affected. All counter changes then go out as a single
//! multi-row upsert. A batch re-applied after a crash therefore changes nothing.
//!
//! Ids are `u64` in the engine and `BIGINT` here; an id above `i64::MAX` is
//! rejected before the transaction opens.

use std::collections::{BTreeMap, HashSet};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, Any, AnyPool, QueryBuilder, Row};
use tracing::debug;

use super::traits::{ActorId, AppliedBatch, ItemId, LikeBatch, LikeStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Rows per multi-row statement; keeps bind parameters under SQLite's limit.
const ROWS_PER_STATEMENT: usize = 300;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn sql_id(id: u64) -> Result<i64, StorageError> {
    i64::try_from(id).map_err(|_| StorageError::IdOutOfRange(id))
}

/// Actor ids per item, converted for binding.
type ItemGroups = BTreeMap<i64, Vec<i64>>;

fn group_by_item(pairs: &[(ActorId, ItemId)]) -> Result<ItemGroups, StorageError> {
    let mut groups = ItemGroups::new();
    for &(actor, item) in pairs {
        groups.entry(sql_id(item)?).or_default().push(sql_id(actor)?);
    }
    Ok(groups)
}

pub struct SqlLikeStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlLikeStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS item_likes (
                    actor_id INTEGER NOT NULL,
                    item_id INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (actor_id, item_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS item_like_counts (
                    item_id INTEGER PRIMARY KEY,
                    like_count INTEGER NOT NULL DEFAULT 0
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS item_likes (
                    actor_id BIGINT NOT NULL,
                    item_id BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    UNIQUE KEY uk_actor_item (actor_id, item_id),
                    INDEX idx_item (item_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS item_like_counts (
                    item_id BIGINT PRIMARY KEY,
                    like_count BIGINT NOT NULL DEFAULT 0
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn insert_like_prefix(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT OR IGNORE INTO item_likes (actor_id, item_id, created_at) "
        } else {
            "INSERT IGNORE INTO item_likes (actor_id, item_id, created_at) "
        }
    }

    fn bump_count_suffix(&self) -> &'static str {
        if self.is_sqlite {
            " ON CONFLICT(item_id) DO UPDATE SET like_count = like_count + excluded.like_count"
        } else {
            " ON DUPLICATE KEY UPDATE like_count = like_count + VALUES(like_count)"
        }
    }

    /// One attempt at the batch. Any error drops the transaction, which rolls it back.
    async fn apply_batch_once(&self, inserts: &ItemGroups, removals: &ItemGroups) -> Result<AppliedBatch, StorageError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut applied = AppliedBatch::default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        for (&item, actors) in inserts {
            for chunk in actors.chunks(ROWS_PER_STATEMENT) {
                let mut query = QueryBuilder::<Any>::new(self.insert_like_prefix());
                query.push_values(chunk, |mut row, &actor| {
                    row.push_bind(actor).push_bind(item).push_bind(now);
                });
                let result = query
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                applied.record(item as ItemId, result.rows_affected() as i64);
            }
        }

        for (&item, actors) in removals {
            for chunk in actors.chunks(ROWS_PER_STATEMENT) {
                let mut query = QueryBuilder::<Any>::new("DELETE FROM item_likes WHERE item_id = ");
                query.push_bind(item).push(" AND actor_id IN (");
                let mut ids = query.separated(", ");
                for &actor in chunk {
                    ids.push_bind(actor);
                }
                ids.push_unseparated(")");
                let result = query
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                applied.record(item as ItemId, -(result.rows_affected() as i64));
            }
        }

        let deltas: Vec<(i64, i64)> = applied
            .count_deltas
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|(&item, &delta)| (item as i64, delta))
            .collect();
        for chunk in deltas.chunks(ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Any>::new("INSERT INTO item_like_counts (item_id, like_count) ");
            query.push_values(chunk, |mut row, &(item, delta)| {
                row.push_bind(item).push_bind(delta);
            });
            query.push(self.bump_count_suffix());
            query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(applied)
    }
}

#[async_trait]
impl LikeStore for SqlLikeStore {
    async fn apply_batch(&self, batch: &LikeBatch) -> Result<AppliedBatch, StorageError> {
        if batch.is_empty() {
            return Ok(AppliedBatch::default());
        }

        let inserts = group_by_item(&batch.inserts)?;
        let removals = group_by_item(&batch.removals)?;

        let applied = retry("sql_apply_batch", &RetryConfig::query(), || {
            self.apply_batch_once(&inserts, &removals)
        })
        .await?;

        debug!(
            inserts = batch.inserts.len(),
            removals = batch.removals.len(),
            inserted = applied.inserted,
            removed = applied.removed,
            "Applied like batch"
        );
        Ok(applied)
    }

    async fn liked_items(&self, actor: ActorId) -> Result<HashSet<ItemId>, StorageError> {
        let actor = sql_id(actor)?;
        retry("sql_liked_items", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT item_id FROM item_likes WHERE actor_id = ?")
                .bind(actor)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| {
                    row.try_get::<i64, _>("item_id")
                        .map(|id| id as ItemId)
                        .map_err(|e| StorageError::Backend(e.to_string()))
                })
                .collect()
        })
        .await
    }

    async fn has_like(&self, actor: ActorId, item: ItemId) -> Result<bool, StorageError> {
        let (actor, item) = (sql_id(actor)?, sql_id(item)?);
        retry("sql_has_like", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT 1 AS present FROM item_likes WHERE actor_id = ? AND item_id = ?")
                .bind(actor)
                .bind(item)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(row.is_some())
        })
        .await
    }

    async fn like_count(&self, item: ItemId) -> Result<i64, StorageError> {
        let item = sql_id(item)?;
        retry("sql_like_count", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT like_count FROM item_like_counts WHERE item_id = ?")
                .bind(item)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            match row {
                Some(row) => row
                    .try_get::<i64, _>("like_count")
                    .map_err(|e| StorageError::Backend(e.to_string())),
                None => Ok(0),
            }
        })
        .await
    }
}
