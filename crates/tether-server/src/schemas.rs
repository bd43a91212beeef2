//! Request/response schemas for the HTTP surface.
//!
//! Wire format is camelCase JSON. Requests tolerate partial bodies where a
//! default is sensible; responses omit absent optional fields.

use serde::{Deserialize, Serialize};

use tether_core::{AgentConfig, AgentMetadata, AgentState, ModelConfig};

/// Body of `POST /api/init`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitRequest {
    /// Model endpoint configuration; omitted fields fall back to server
    /// defaults.
    pub model: Option<ModelConfig>,
    /// Agent configuration. `deviceKey` is required.
    pub agent: Option<AgentConfig>,
    /// Rebuild even if an agent already exists for the device.
    pub force: bool,
}

/// Generic acknowledgment for lifecycle operations.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Device the operation targeted.
    pub device_key: String,
    /// Human-readable detail.
    pub message: String,
}

/// Body of `POST /api/chat` and `POST /api/chat/stream`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Target device.
    pub device_key: String,
    /// Task input for the run.
    pub message: String,
}

/// Response of the blocking `POST /api/chat`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    /// Final message, or the failure text when `success` is false.
    pub result: String,
    /// Steps executed.
    pub steps: u32,
    /// Whether the run completed successfully.
    pub success: bool,
}

/// Body of `POST /api/interrupt`, `/api/reset`, `/api/destroy`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    /// Target device.
    pub device_key: String,
}

/// Query of `GET /api/status`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusQuery {
    /// Restrict the report to one device.
    pub device_key: Option<String>,
}

/// Per-device status report.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Server version.
    pub version: String,
    /// Whether an agent is initialized for the device.
    pub initialized: bool,
    /// Lifecycle state, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentState>,
    /// Current step counter of the durable handle. Omitted when the
    /// handle is busy (status never blocks behind a device hold).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
}

/// Fleet-wide status report (no `deviceKey` given).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetResponse {
    /// Server version.
    pub version: String,
    /// Metadata of every initialized agent.
    pub devices: Vec<AgentMetadata>,
}
