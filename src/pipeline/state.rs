//! Pipeline state management

use crate::error::Stage;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Pipeline state machine
///
/// Represents the lifecycle of one stream pipeline. State transitions are
/// validated so the owner and the worker thread can both drive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Pipeline is created but no worker runs
    Idle,

    /// Worker is opening the source and the decoder
    Opening,

    /// Worker is reading, decoding and publishing frames
    Streaming {
        /// When the first packet read began
        started_at: Instant,
    },

    /// Stop requested or source exhausted, worker is winding down
    Stopping,

    /// Worker exited normally and released its resources
    Stopped,

    /// Worker exited on an unrecoverable error
    Failed {
        /// Stage the error came from
        stage: Stage,
    },
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // From Idle
            (Idle, Opening) => true,

            // From Opening
            (Opening, Streaming { .. }) => true,
            (Opening, Stopping) => true, // Can abort while connecting
            (Opening, Failed { .. }) => true,

            // From Streaming
            (Streaming { .. }, Stopping) => true,
            (Streaming { .. }, Failed { .. }) => true,

            // From Stopping
            (Stopping, Stopped) => true,

            // Finished pipelines are reset before a restart
            (Stopped, Idle) => true,
            (Failed { .. }, Idle) => true,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Opening => "Opening",
            PipelineState::Streaming { .. } => "Streaming",
            PipelineState::Stopping => "Stopping",
            PipelineState::Stopped => "Stopped",
            PipelineState::Failed { .. } => "Failed",
        }
    }

    /// Check if a worker is expected to be alive in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Opening | PipelineState::Streaming { .. } | PipelineState::Stopping
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, PipelineState::Streaming { .. })
    }

    /// Check if the worker has exited, whatever the reason
    pub fn is_finished(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed { .. })
    }

    /// Get the duration since streaming began (if streaming)
    pub fn streaming_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Streaming { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Failed { stage } => write!(f, "Failed ({})", stage),
            other => write!(f, "{}", other.description()),
        }
    }
}

/// State shared between a pipeline handle and its worker thread
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<PipelineState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PipelineState::Idle)),
        }
    }

    pub fn get(&self) -> PipelineState {
        *self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `target` if the current state allows it, returns whether it did
    pub fn transition(&self, target: PipelineState) -> bool {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.can_transition_to(&target) {
            debug!("Pipeline state {} -> {}", *state, target);
            *state = target;
            true
        } else {
            warn!("Rejected pipeline state transition {} -> {}", *state, target);
            false
        }
    }

    /// Apply `target` only when the current state satisfies `allowed`
    pub fn transition_if(
        &self,
        allowed: impl Fn(&PipelineState) -> bool,
        target: PipelineState,
    ) -> bool {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if allowed(&state) && state.can_transition_to(&target) {
            debug!("Pipeline state {} -> {}", *state, target);
            *state = target;
            true
        } else {
            false
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
