//! Configuration value objects cached alongside each agent handle.
//!
//! Both types are immutable once stored: a config change goes through a
//! forced re-initialize, never in-place mutation. The registry caches the
//! pair so reset can rebuild a handle without the caller re-supplying it.

use serde::{Deserialize, Serialize};

/// Model endpoint configuration for one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    /// OpenAI-compatible endpoint base URL.
    pub base_url: String,
    /// API key; providers that need none accept any placeholder.
    pub api_key: String,
    /// Model identifier sent with each request.
    pub model_name: String,
    /// Completion token cap per request.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling cutoff.
    pub top_p: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: "EMPTY".to_string(),
            model_name: "phone-use-agent".to_string(),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
        }
    }
}

/// Per-device agent behavior configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Opaque key of the device this agent drives. Carried as data only —
    /// no identity reconciliation happens here.
    pub device_key: String,
    /// Step limit per streaming session or blocking run.
    pub max_steps: u32,
    /// Response language hint.
    pub lang: String,
    /// Optional system prompt override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Verbose backend logging.
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_key: String::new(),
            max_steps: 100,
            lang: "zh".to_string(),
            system_prompt: None,
            verbose: false,
        }
    }
}
