//! Runtime error types.

use tether_core::BackendError;

/// Errors raised by the coordination layer.
///
/// `DeviceBusy` is retryable; the rest are terminal for the current
/// request. Each maps to a distinct category so callers can apply
/// different retry policy.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Exclusive device access unavailable within the requested timeout.
    #[error("Device {0} is busy")]
    DeviceBusy(String),

    /// Operation targets a device with no registry entry.
    #[error("Agent not initialized for device {0}")]
    AgentNotInitialized(String),

    /// Backend construction failed; the registry holds nothing for the key.
    #[error("Failed to initialize agent for device {key}: {message}")]
    AgentInitialization {
        /// Device key the initialization targeted.
        key: String,
        /// Backend failure description.
        message: String,
    },

    /// Backend failure surfaced through a synchronous operation.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Internal / unexpected error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether the caller can retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy(_))
    }

    /// Error category string for wire responses and logs.
    pub fn category(&self) -> &str {
        match self {
            Self::DeviceBusy(_) => "device_busy",
            Self::AgentNotInitialized(_) => "agent_not_initialized",
            Self::AgentInitialization { .. } => "agent_initialization",
            Self::Backend(_) => "backend",
            Self::Internal(_) => "internal",
        }
    }
}
