// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background work: ledger flush, reconciliation, the event consumer, and the
//! periodic scheduler that drives them.

pub mod consumer;
pub mod flush;
pub mod reconcile;
pub mod scheduler;

pub use consumer::{collapse, BatchConsumer, ConsumeReport};
pub use flush::{FlushJob, FlushReport};
pub use reconcile::{ReconcileJob, ReconcileReport};
pub use scheduler::spawn_periodic;
