// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams channel with a consumer group.
//!
//! Reads first drain this consumer's pending list (`XREADGROUP ... 0`), so
//! entries delivered before a crash are seen again after restart as long as
//! the consumer name is stable. Only when nothing is pending does it block
//! for new entries (`>`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tracing::{info, warn};

use super::channel::EventChannel;
use super::{Delivery, LikeEvent};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

pub struct RedisStreamChannel {
    connection: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    /// `MAXLEN ~` cap; `None` never trims
    maxlen: Option<usize>,
}

impl RedisStreamChannel {
    /// Connect on a dedicated connection (blocking reads must not stall other
    /// commands) and make sure the consumer group exists.
    pub async fn connect(
        connection_string: &str,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_stream_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        let channel = Self {
            connection,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            maxlen: None,
        };
        channel.ensure_group().await?;
        Ok(channel)
    }

    /// Cap the stream length on every append.
    ///
    /// Trimming is not aware of the consumer group: an entry removed while
    /// still unread or pending comes back without a payload and is lost.
    #[must_use]
    pub fn with_maxlen(mut self, maxlen: Option<usize>) -> Self {
        self.maxlen = maxlen;
        self
    }

    async fn ensure_group(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    async fn read(&self, start: &str, max: usize, block: Option<Duration>) -> Result<Vec<Delivery>, StorageError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let mut conn = self.connection.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[start], &options)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let event = match entry.get::<String>("payload") {
                    Some(payload) => LikeEvent::from_payload(&payload),
                    None => Err("entry has no payload".to_string()),
                };
                if let Err(reason) = &event {
                    warn!(id = %entry.id, reason = %reason, "Malformed stream entry");
                }
                deliveries.push(Delivery { id: entry.id, event });
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl EventChannel for RedisStreamChannel {
    /// Single `XADD`, never retried here: a retry after a lost reply would
    /// append the event twice.
    async fn publish(&self, event: &LikeEvent) -> Result<String, StorageError> {
        let fields = event
            .to_stream_fields()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut conn = self.connection.clone();

        let appended: Result<String, redis::RedisError> = match self.maxlen {
            Some(maxlen) => {
                conn.xadd_maxlen(&self.stream, StreamMaxlen::Approx(maxlen), "*", fields.as_slice())
                    .await
            }
            None => conn.xadd(&self.stream, "*", fields.as_slice()).await,
        };
        appended.map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn poll_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, StorageError> {
        let pending = self.read("0", max, None).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        let block = (!wait.is_zero()).then_some(wait);
        self.read(">", max, block).await
    }

    async fn ack(&self, ids: &[String]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.connection.clone();

        retry("redis_xack", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let _: usize = conn.xack(&self.stream, &self.group, ids).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}
