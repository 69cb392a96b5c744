// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Like engine coordinator.
//!
//! The [`LikeEngine`] ties the components together:
//! - hot-key detector and tiered cache in front of the KV store
//! - toggle state machine writing UserState (plus ledger or events)
//! - flush, reconcile and consumer jobs feeding the durable store
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use like_engine::{LikeEngine, LikeEngineConfig, EngineState};
//! use like_engine::storage::memory::{InMemoryKv, InMemoryLikeStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = LikeEngineConfig::default();
//! let mut engine = LikeEngine::new(
//!     config,
//!     Arc::new(InMemoryKv::new()),
//!     Arc::new(InMemoryLikeStore::new()),
//!     None,
//! ).expect("valid config");
//!
//! assert_eq!(engine.state(), EngineState::Ready);
//! engine.start().expect("start");
//! engine.confirm(7, 42).await.expect("first like");
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::EngineState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::TieredCache;
use crate::config::{LikeEngineConfig, WriteMode};
use crate::error::LikeError;
use crate::events::EventChannel;
use crate::hotkey::{HotKeyConfig, HotKeyDetector};
use crate::jobs::{BatchConsumer, FlushJob, ReconcileJob};
use crate::storage::traits::{KvStore, LikeStore};
use crate::toggle::keys::KeySpace;
use crate::toggle::slice::SliceClock;
use crate::toggle::ToggleService;

/// Main engine handle.
///
/// Toggles and reads are served as soon as the engine is built; background
/// jobs run between [`start`](Self::start) and [`shutdown`](Self::shutdown).
pub struct LikeEngine {
    pub(super) config: LikeEngineConfig,

    pub(super) state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    pub(super) store: Arc<dyn LikeStore>,
    pub(super) detector: Arc<HotKeyDetector>,
    pub(super) cache: Arc<TieredCache>,
    pub(super) toggles: ToggleService,

    pub(super) flush: Arc<FlushJob>,
    pub(super) reconcile: Arc<ReconcileJob>,
    pub(super) consumer: Option<Arc<BatchConsumer>>,

    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) tasks: Vec<JoinHandle<()>>,
}

impl LikeEngine {
    /// Build an engine over existing collaborators.
    ///
    /// `channel` is required in [`WriteMode::Event`].
    pub fn new(
        config: LikeEngineConfig,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn LikeStore>,
        channel: Option<Arc<dyn EventChannel>>,
    ) -> Result<Self, LikeError> {
        config.validate().map_err(LikeError::Structural)?;

        let detector = Arc::new(HotKeyDetector::new(HotKeyConfig::from(&config)));
        let cache = Arc::new(TieredCache::new(
            kv.clone(),
            detector.clone(),
            config.local_cache_capacity,
            Duration::from_secs(config.local_cache_ttl_secs),
        ));
        let toggles = ToggleService::new(&config, kv.clone(), cache.clone(), channel.clone())?;

        let keys = KeySpace::new(config.key_prefix.clone());
        let store_timeout = Duration::from_millis(config.store_timeout_ms);
        let flush = Arc::new(FlushJob::new(
            kv.clone(),
            store.clone(),
            keys.clone(),
            SliceClock::new(config.slice_secs),
            store_timeout,
        ));
        let reconcile = Arc::new(ReconcileJob::new(
            kv,
            store.clone(),
            channel.clone(),
            flush.clone(),
            keys,
            config.write_mode,
            Duration::from_secs(config.reconcile_grace_secs),
            store_timeout,
        ));
        let consumer = match (config.write_mode, channel) {
            (WriteMode::Event, Some(channel)) => Some(Arc::new(BatchConsumer::new(
                channel,
                store.clone(),
                config.consumer_batch_size,
                Duration::from_millis(config.consumer_poll_ms),
                store_timeout,
            ))),
            _ => None,
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        let engine = Self {
            config,
            state: state_tx,
            state_rx,
            store,
            detector,
            cache,
            toggles,
            flush,
            reconcile,
            consumer,
            shutdown_tx,
            tasks: Vec::new(),
        };
        engine.set_state(EngineState::Ready);
        info!(mode = ?engine.config.write_mode, "Like engine ready");
        Ok(engine)
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn config(&self) -> &LikeEngineConfig {
        &self.config
    }

    pub fn toggles(&self) -> &ToggleService {
        &self.toggles
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn detector(&self) -> &Arc<HotKeyDetector> {
        &self.detector
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }
}
