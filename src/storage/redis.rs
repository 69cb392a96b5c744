// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for UserState and ledger hashes.
//!
//! Reads, plain writes and ledger release are wrapped in [`retry`] with the
//! query preset. Toggles and ledger release run as Lua scripts (`EVALSHA`,
//! falling back to `EVAL` on a cold script cache), so each is one atomic step
//! inside Redis. Toggle scripts are sent once; whether to try again is up to
//! the caller.
//!
//! Key scanning uses a `SCAN` cursor loop rather than `KEYS`, and the optional
//! namespace prefix is stripped from the keys it returns.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};

use super::scripts::{self, LedgerTouch, ScriptCall, ScriptOutcome};
use super::traits::{KvStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Field/value pairs per `RELEASE_LEDGER` invocation.
const RELEASE_CHUNK: usize = 500;
const SCAN_COUNT: usize = 500;

struct LoadedScripts {
    confirm_with_ledger: Script,
    cancel_with_ledger: Script,
    confirm_state_only: Script,
    cancel_state_only: Script,
    release_ledger: Script,
}

impl LoadedScripts {
    fn new() -> Self {
        Self {
            confirm_with_ledger: Script::new(scripts::CONFIRM_WITH_LEDGER),
            cancel_with_ledger: Script::new(scripts::CANCEL_WITH_LEDGER),
            confirm_state_only: Script::new(scripts::CONFIRM_STATE_ONLY),
            cancel_state_only: Script::new(scripts::CANCEL_STATE_ONLY),
            release_ledger: Script::new(scripts::RELEASE_LEDGER),
        }
    }
}

pub struct RedisKvStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing a shared Redis instance
    prefix: String,
    scripts: LoadedScripts,
}

impl RedisKvStore {
    /// Create a new Redis store without a namespace prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional namespace prefix.
    ///
    /// The prefix is prepended to all keys, including the ones scripts touch.
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Use startup config: fast-fail, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            scripts: LoadedScripts::new(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    /// Clone of the connection manager (shared with the stream channel)
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Run a confirm/cancel script exactly once.
    ///
    /// A lost reply after the script ran would make a second attempt see its
    /// own write and report `Rejected`, so no retry happens here.
    async fn invoke_toggle(
        &self,
        name: &'static str,
        script: &Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<ScriptOutcome, StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        for arg in &args {
            invocation.arg(arg);
        }

        let reply: Option<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(format!("{}: {}", name, e)))?;

        Ok(match reply {
            Some(marker) => ScriptOutcome::Applied { marker },
            None => ScriptOutcome::Rejected,
        })
    }

    fn ledger_args(touch: &LedgerTouch) -> (String, String) {
        (touch.field.clone(), touch.ttl_secs.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hget", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = conn.hget(&key, field).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hset", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = conn.hset(&key, field, value).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hdel", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: u32 = conn.hdel(&key, field).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hexists", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let exists: bool = conn.hexists(&key, field).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if fields.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hmget", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                // explicit HMGET so a single field still yields an array reply
                let values: Vec<Option<String>> = cmd("HMGET")
                    .arg(&key)
                    .arg(fields)
                    .query_async(&mut conn)
                    .await?;
                Ok(values)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hgetall", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let map: HashMap<String, String> = conn.hgetall(&key).await?;
                Ok(map)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hkeys", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let fields: Vec<String> = conn.hkeys(&key).await?;
                Ok(fields)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}*", self.prefixed_key(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let conn = self.connection.clone();
            let pattern = pattern.clone();
            let (next, batch): (u64, Vec<String>) = retry("redis_scan", &RetryConfig::query(), || {
                let mut conn = conn.clone();
                let pattern = pattern.clone();
                async move {
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

            keys.extend(batch.iter().map(|k| self.strip_prefix(k).to_string()));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_del", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn run_script(&self, call: &ScriptCall) -> Result<ScriptOutcome, StorageError> {
        match call {
            ScriptCall::Confirm { user_key, item, marker, ledger: Some(touch) } => {
                let (field, ttl) = Self::ledger_args(touch);
                self.invoke_toggle(
                    call.name(),
                    &self.scripts.confirm_with_ledger,
                    vec![self.prefixed_key(&touch.key), self.prefixed_key(user_key)],
                    vec![field, item.clone(), marker.clone(), ttl],
                )
                .await
            }
            ScriptCall::Cancel { user_key, item, ledger: Some(touch) } => {
                let (field, ttl) = Self::ledger_args(touch);
                self.invoke_toggle(
                    call.name(),
                    &self.scripts.cancel_with_ledger,
                    vec![self.prefixed_key(&touch.key), self.prefixed_key(user_key)],
                    vec![field, item.clone(), ttl],
                )
                .await
            }
            ScriptCall::Confirm { user_key, item, marker, ledger: None } => {
                self.invoke_toggle(
                    call.name(),
                    &self.scripts.confirm_state_only,
                    vec![self.prefixed_key(user_key)],
                    vec![item.clone(), marker.clone()],
                )
                .await
            }
            ScriptCall::Cancel { user_key, item, ledger: None } => {
                self.invoke_toggle(
                    call.name(),
                    &self.scripts.cancel_state_only,
                    vec![self.prefixed_key(user_key)],
                    vec![item.clone()],
                )
                .await
            }
            ScriptCall::ReleaseLedger { ledger_key, entries } => {
                let key = self.prefixed_key(ledger_key);
                let mut released = 0usize;

                for chunk in entries.chunks(RELEASE_CHUNK) {
                    let conn = self.connection.clone();
                    let script = &self.scripts.release_ledger;
                    let count: usize = retry("redis_release_ledger", &RetryConfig::query(), || {
                        let mut conn = conn.clone();
                        let mut invocation = script.key(&key);
                        for (field, value) in chunk {
                            invocation.arg(field).arg(value);
                        }
                        async move { invocation.invoke_async(&mut conn).await }
                    })
                    .await
                    .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;
                    released += count;
                }
                Ok(ScriptOutcome::Released(released))
            }
        }
    }
}
