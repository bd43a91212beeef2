//! Agent lifecycle state and per-device metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime state of an agent bound to one device key.
///
/// Transitions: `Initializing → {Idle, Error}`; `Idle ⇄ Busy` via
/// acquire/release; `Busy → Error` only through a failed scoped use;
/// `Error → Idle` via reset or a successful forced re-initialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Agent is being created; no entry committed yet.
    Initializing,
    /// Agent initialized and not processing.
    Idle,
    /// Device lock is held; a request is in flight.
    Busy,
    /// Agent encountered an error.
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Bookkeeping record for one agent instance.
///
/// Created on initialize, mutated by acquire/release/step outcomes,
/// destroyed only by an explicit destroy. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    /// Opaque device key this agent is bound to.
    pub device_key: String,
    /// Current lifecycle state.
    pub state: AgentState,
    /// When the agent was initialized.
    pub created_at: DateTime<Utc>,
    /// Last acquire or successful operation.
    pub last_used_at: DateTime<Utc>,
    /// Message of the most recent error, cleared on reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentMetadata {
    /// Fresh metadata for a newly initialized agent.
    pub fn new(device_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            device_key: device_key.into(),
            state: AgentState::Idle,
            created_at: now,
            last_used_at: now,
            error_message: None,
        }
    }
}
