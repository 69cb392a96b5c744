// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level error taxonomy.

use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone)]
pub enum LikeError {
    /// The toggle's target state already holds (double confirm, cancel of nothing).
    #[error("Conflict: {0}")]
    Conflict(&'static str),

    /// A collaborator was unreachable or timed out. Retrying may succeed.
    #[error("Transient store error: {0}")]
    Transient(#[from] StorageError),

    /// The UserState change was made but the event could not be published.
    /// `compensated` reports whether the state change was rolled back.
    #[error("Event publish failed ({reason}), compensated: {compensated}")]
    PublishFailure { reason: String, compensated: bool },

    /// Malformed key or value found in a collaborator.
    #[error("Structural error: {0}")]
    Structural(String),
}

impl LikeError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(e) if e.is_retryable())
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_id_is_not_transient() {
        let err: LikeError = StorageError::IdOutOfRange(u64::MAX).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_storage_error_maps_to_transient() {
        let err: LikeError = StorageError::Timeout("hget".into()).into();
        assert!(err.is_transient());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_display() {
        let err = LikeError::PublishFailure { reason: "broker down".into(), compensated: true };
        assert_eq!(err.to_string(), "Event publish failed (broker down), compensated: true");
        assert!(LikeError::Conflict("already liked").is_conflict());
    }
}
