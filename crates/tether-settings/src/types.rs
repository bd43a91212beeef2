//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file is valid — missing fields get their production default during
//! deserialization.

use serde::{Deserialize, Serialize};

/// Root settings type for the tether server.
///
/// Loaded from `~/.tether/settings.json` with defaults applied for missing
/// fields; `TETHER_*` environment variables override specific values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Settings schema version.
    pub version: String,
    /// HTTP server network settings.
    pub server: ServerSettings,
    /// Default model endpoint, used when an init request omits fields.
    pub model: ModelDefaults,
    /// Streaming session tuning.
    pub session: SessionSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            model: ModelDefaults::default(),
            session: SessionSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// HTTP server network settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Fallback model endpoint configuration.
///
/// An init request may omit `baseUrl`/`apiKey`/`modelName`; these fill the
/// gaps. An empty `base_url` here means the request must supply one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelDefaults {
    /// Default endpoint base URL.
    pub base_url: String,
    /// Default API key.
    pub api_key: String,
    /// Default model identifier.
    pub model_name: String,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: "EMPTY".to_string(),
            model_name: "phone-use-agent".to_string(),
        }
    }
}

/// Streaming session tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Step limit applied when an agent config does not set one.
    pub max_steps: u32,
    /// Event channel capacity between session driver and consumer.
    pub channel_capacity: usize,
    /// How long the reaper waits for an abandoned step worker before
    /// logging and giving up the join.
    pub join_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_steps: 100,
            channel_capacity: 256,
            join_timeout_ms: 30_000,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Tracing filter directive, e.g. `info` or `tether_runtime=debug`.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
