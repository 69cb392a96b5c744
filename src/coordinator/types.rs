// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine facade.

/// Engine lifecycle state.
///
/// Use [`super::LikeEngine::state()`] to read it or
/// [`super::LikeEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background tasks not spawned
    Created,
    /// Connecting to backends
    Connecting,
    /// Collaborators in place; toggles are served
    Ready,
    /// Background tasks running
    Running,
    /// Stopping tasks and flushing what is staged
    ShuttingDown,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether toggles and reads are served in this state.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::ShuttingDown)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
