//! The backend capability surface the coordination layer drives.
//!
//! The automation/inference backend is an external collaborator. The
//! coordination core sees it only through [`AgentBackend`]: a synchronous
//! `step`, a readable step counter, a per-run `reset`, and a conversational
//! context that supports cheap snapshot/restore. Construction goes through
//! [`BackendFactory`] with streaming and takeover callbacks passed as
//! constructor parameters — never injected after the fact.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::config::{AgentConfig, ModelConfig};
use crate::events::StepResult;

/// Opaque failure reported by the external backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(String);

impl BackendError {
    /// Wrap a backend failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Snapshot of a backend's conversational context plus its step counter.
///
/// Entries are opaque JSON — the coordination layer copies them between
/// handle instances without inspecting them. Cloning is shallow and cheap
/// relative to a step (network round trip).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextSnapshot {
    /// Conversation entries, oldest first.
    pub entries: Vec<Value>,
    /// Steps executed so far in the current run.
    pub step_count: u32,
}

/// Callback invoked with incremental model output as it arrives.
pub type ThinkingCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked when the backend requests manual takeover.
pub type TakeoverCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks wired into a backend at construction time.
#[derive(Clone, Default)]
pub struct BackendCallbacks {
    /// Receives partial model output. Must not block.
    pub on_thinking: Option<ThinkingCallback>,
    /// Receives takeover requests. Must not block.
    pub on_takeover: Option<TakeoverCallback>,
}

impl BackendCallbacks {
    /// Callbacks with only a thinking-chunk receiver.
    pub fn with_thinking(on_thinking: ThinkingCallback) -> Self {
        Self {
            on_thinking: Some(on_thinking),
            on_takeover: None,
        }
    }
}

impl fmt::Debug for BackendCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCallbacks")
            .field("on_thinking", &self.on_thinking.is_some())
            .field("on_takeover", &self.on_takeover.is_some())
            .finish()
    }
}

/// One automation conversation against a backend.
///
/// `step` is synchronous and may block on network I/O — callers run it on a
/// blocking-capable worker. A handle is single-writer: the coordination
/// layer guarantees no two threads touch it concurrently.
pub trait AgentBackend: Send {
    /// Execute one step. The first step of a run carries the task input;
    /// subsequent steps carry `None`.
    fn step(&mut self, task: Option<&str>) -> Result<StepResult, BackendError>;

    /// Steps executed in the current run.
    fn step_count(&self) -> u32;

    /// Clear per-run counters. Does not discard conversational context.
    fn reset(&mut self);

    /// Copy out the conversational context and step counter.
    fn snapshot(&self) -> ContextSnapshot;

    /// Replace the conversational context and step counter.
    fn restore(&mut self, snapshot: ContextSnapshot);
}

impl fmt::Debug for dyn AgentBackend + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBackend").finish_non_exhaustive()
    }
}

/// Constructs backend instances from cached configuration.
pub trait BackendFactory: Send + Sync {
    /// Build a fresh backend. Streaming/takeover callbacks are constructor
    /// parameters of the backend, supplied here.
    fn build(
        &self,
        model: &ModelConfig,
        agent: &AgentConfig,
        callbacks: BackendCallbacks,
    ) -> Result<Box<dyn AgentBackend>, BackendError>;
}
