// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: connect, start background tasks, shut down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{LikeEngineConfig, WriteMode};
use crate::error::LikeError;
use crate::events::{EventChannel, RedisStreamChannel};
use crate::jobs::spawn_periodic;
use crate::storage::redis::RedisKvStore;
use crate::storage::sql::SqlLikeStore;
use crate::toggle::keys::KeySpace;

use super::{EngineState, LikeEngine};

/// How long the eviction monitor waits on the queue before rechecking shutdown.
const EVICTION_POLL: Duration = Duration::from_secs(1);

impl LikeEngine {
    /// Connect to Redis and the SQL store named in `config` and build an engine.
    ///
    /// Startup flow:
    /// 1. Validate config
    /// 2. Connect to SQL (system of record) and create tables
    /// 3. Connect to Redis (UserState, ledger, scripts)
    /// 4. In event mode, open the stream channel and its consumer group
    #[tracing::instrument(skip(config), fields(mode = ?config.write_mode))]
    pub async fn connect(config: LikeEngineConfig) -> Result<Self, LikeError> {
        config.validate().map_err(LikeError::Structural)?;
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| LikeError::Structural("redis_url is required".into()))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| LikeError::Structural("sql_url is required".into()))?;

        let phase_start = Instant::now();
        info!("Connecting to SQL (system of record)...");
        let store = match SqlLikeStore::new(&sql_url).await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "SQL connection required for startup");
                crate::metrics::record_error("startup", "connect", "sql");
                return Err(e.into());
            }
        };
        crate::metrics::record_startup_phase("sql_connect", phase_start.elapsed());

        let phase_start = Instant::now();
        info!("Connecting to Redis...");
        let kv = match RedisKvStore::new(&redis_url).await {
            Ok(kv) => kv,
            Err(e) => {
                error!(error = %e, "Redis connection required for startup");
                crate::metrics::record_error("startup", "connect", "redis");
                return Err(e.into());
            }
        };
        crate::metrics::record_startup_phase("redis_connect", phase_start.elapsed());

        let channel: Option<Arc<dyn EventChannel>> = match config.write_mode {
            WriteMode::Ledger => None,
            WriteMode::Event => {
                let phase_start = Instant::now();
                let consumer = config
                    .consumer_name
                    .clone()
                    .unwrap_or_else(|| format!("like-engine-{}", uuid::Uuid::new_v4()));
                if config.consumer_name.is_none() {
                    warn!(consumer = %consumer, "No consumer_name configured; pending entries will not survive a restart");
                }
                let stream = KeySpace::new(config.key_prefix.clone()).stream_key(&config.stream_name);
                let channel =
                    RedisStreamChannel::connect(&redis_url, &stream, &config.consumer_group, &consumer)
                        .await?
                        .with_maxlen(config.stream_maxlen);
                crate::metrics::record_startup_phase("stream_connect", phase_start.elapsed());
                Some(Arc::new(channel))
            }
        };

        Self::new(config, Arc::new(kv), Arc::new(store), channel)
    }

    /// Spawn the background tasks:
    /// - detector decay (skipped when its interval is 0)
    /// - eviction monitor demoting keys that left the Top-K set
    /// - ledger flush (ledger mode) or batch consumer (event mode)
    /// - reconciliation
    pub fn start(&mut self) -> Result<(), LikeError> {
        if self.state() != EngineState::Ready {
            return Err(LikeError::Structural(format!("cannot start from {}", self.state())));
        }
        let _ = self.shutdown_tx.send(false);

        let detector = self.detector.clone();
        self.tasks.extend(spawn_periodic(
            "hotkey_decay",
            Duration::from_secs(self.config.hotkey_decay_interval_secs),
            self.shutdown_tx.subscribe(),
            move || {
                let detector = detector.clone();
                async move {
                    detector.decay();
                    crate::metrics::set_detector_stats(detector.total(), detector.snapshot().len());
                }
            },
        ));

        self.spawn_eviction_monitor();

        match &self.consumer {
            Some(consumer) => {
                let consumer = consumer.clone();
                let shutdown = self.shutdown_tx.subscribe();
                self.tasks.push(tokio::spawn(async move { consumer.run(shutdown).await }));
            }
            None => {
                let flush = self.flush.clone();
                self.tasks.extend(spawn_periodic(
                    "ledger_flush",
                    Duration::from_secs(self.config.flush_interval_secs),
                    self.shutdown_tx.subscribe(),
                    move || {
                        let flush = flush.clone();
                        async move {
                            if let Err(e) = flush.run_at(Utc::now()).await {
                                warn!(error = %e, "Ledger flush stopped; unflushed slices stay staged for the next pass");
                            }
                        }
                    },
                ));
            }
        }

        let reconcile = self.reconcile.clone();
        self.tasks.extend(spawn_periodic(
            "reconcile",
            Duration::from_secs(self.config.reconcile_interval_secs),
            self.shutdown_tx.subscribe(),
            move || {
                let reconcile = reconcile.clone();
                async move {
                    if let Err(e) = reconcile.run().await {
                        warn!(error = %e, "Reconciliation failed");
                    }
                }
            },
        ));

        self.set_state(EngineState::Running);
        info!(tasks = self.tasks.len(), "Like engine running");
        Ok(())
    }

    fn spawn_eviction_monitor(&mut self) {
        let Some(mut evicted) = self.detector.take_evicted() else {
            warn!("Eviction queue already taken; local tier will only expire by TTL");
            return;
        };
        let cache = self.cache.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    item = evicted.recv_timeout(EVICTION_POLL) => {
                        if let Some(item) = item {
                            let demoted = cache.demote(&item.key);
                            debug!(key = %item.key, count = item.count_at_eviction, demoted, "Demoted evicted key");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Stop background tasks, letting any in-flight batch commit, then flush
    /// whatever the ledger still holds.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        info!("Shutting down like engine...");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if self.config.write_mode == WriteMode::Ledger {
            match self.flush.flush_all().await {
                Ok(report) => info!(
                    inserted = report.applied.inserted,
                    removed = report.applied.removed,
                    "Final flush complete"
                ),
                Err(e) => warn!(error = %e, "Final flush failed; reconciliation will pick the slices up"),
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Like engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryChannel;
    use crate::storage::memory::{InMemoryKv, InMemoryLikeStore};

    fn ledger_engine() -> LikeEngine {
        LikeEngine::new(
            LikeEngineConfig::default(),
            Arc::new(InMemoryKv::new()),
            Arc::new(InMemoryLikeStore::new()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown_flushes() {
        let mut engine = ledger_engine();
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.confirm(1, 10).await.unwrap();
        engine.shutdown().await;

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.like_count(10).await.unwrap(), 1);
        assert!(engine.confirm(2, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut engine = ledger_engine();
        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_mode_without_channel_fails() {
        let config = LikeEngineConfig { write_mode: WriteMode::Event, ..Default::default() };
        let built = LikeEngine::new(
            config,
            Arc::new(InMemoryKv::new()),
            Arc::new(InMemoryLikeStore::new()),
            None,
        );
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn test_event_mode_consumer_applies() {
        let config = LikeEngineConfig {
            write_mode: WriteMode::Event,
            consumer_poll_ms: 20,
            ..Default::default()
        };
        let channel = Arc::new(InMemoryChannel::new());
        let mut engine = LikeEngine::new(
            config,
            Arc::new(InMemoryKv::new()),
            Arc::new(InMemoryLikeStore::new()),
            Some(channel.clone()),
        )
        .unwrap();
        engine.start().unwrap();

        engine.confirm(1, 10).await.unwrap();
        for _ in 0..200 {
            if engine.like_count(10).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.shutdown().await;

        assert_eq!(engine.like_count(10).await.unwrap(), 1);
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_decay_still_starts() {
        let config = LikeEngineConfig { hotkey_decay_interval_secs: 0, ..Default::default() };
        let mut engine = LikeEngine::new(
            config,
            Arc::new(InMemoryKv::new()),
            Arc::new(InMemoryLikeStore::new()),
            None,
        )
        .unwrap();
        engine.start().unwrap();
        // eviction monitor, flush and reconcile; no decay task
        assert_eq!(engine.tasks.len(), 3);

        engine.confirm(1, 10).await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.like_count(10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connect_requires_urls() {
        let err = LikeEngine::connect(LikeEngineConfig::default()).await.err().unwrap();
        assert!(matches!(err, LikeError::Structural(_)));
    }
}
