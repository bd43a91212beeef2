//! Step results and the streaming event wire format.
//!
//! A [`StepResult`] is what the backend returns for one unit of work. A
//! [`StreamEvent`] is what a streaming session publishes to its consumer:
//! zero or more `thinking_chunk` events, then one `step` event per completed
//! step, then exactly one terminal event (`done`, `aborted`, or `error`).
//! Events are transient — never persisted — and drive real-time UI updates.

use serde::{Deserialize, Serialize};

/// Outcome of one backend step (one inference call plus optional action
/// execution).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Model reasoning text for this step.
    pub thinking: String,
    /// Human-readable description of the action taken.
    pub action: String,
    /// Whether the step executed successfully.
    pub success: bool,
    /// Whether the backend considers the overall task finished.
    pub finished: bool,
    /// Final message, populated when `finished` is set.
    pub message: String,
}

/// Events published by a streaming session, in order.
///
/// Any `ThinkingChunk` sequence for a step precedes that step's `Step`
/// event. Exactly one terminal event (`Done`, `Aborted`, `Error`) ends the
/// stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Incremental model output, forwarded as it arrives.
    #[serde(rename = "thinking_chunk")]
    ThinkingChunk {
        /// Text fragment.
        chunk: String,
    },

    /// One completed step.
    #[serde(rename = "step")]
    Step {
        /// 1-based step index within the session.
        step: u32,
        /// Model reasoning text.
        thinking: String,
        /// Action description.
        action: String,
        /// Whether the step succeeded.
        success: bool,
        /// Whether the backend reported the task finished.
        finished: bool,
    },

    /// Session completed (task finished or step limit reached).
    #[serde(rename = "done")]
    Done {
        /// Final message from the backend.
        message: String,
        /// Total steps executed.
        steps: u32,
        /// Success flag of the final step.
        success: bool,
    },

    /// Session stopped by a cooperative abort. No further events follow.
    #[serde(rename = "aborted")]
    Aborted,

    /// Session stopped by a backend failure. No further events follow.
    #[serde(rename = "error")]
    Error {
        /// Error description.
        message: String,
    },
}

impl StreamEvent {
    /// Wire tag for this event, matching the serde `type` discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::Step { .. } => "step",
            Self::Done { .. } => "done",
            Self::Aborted => "aborted",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Aborted | Self::Error { .. })
    }

    /// Build a `Step` event from a completed step result.
    pub fn step(index: u32, result: &StepResult) -> Self {
        Self::Step {
            step: index,
            thinking: result.thinking.clone(),
            action: result.action.clone(),
            success: result.success,
            finished: result.finished,
        }
    }
}
