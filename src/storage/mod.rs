// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator seams and their backends.
//!
//! - [`traits::KvStore`]: hash map store with atomic scripts (Redis, in-memory)
//! - [`traits::LikeStore`]: durable like facts and counters (SQL, in-memory)

pub mod memory;
pub mod redis;
pub mod scripts;
pub mod sql;
pub mod traits;
