//! Settings loading: defaults ← user file (deep-merged) ← env overrides.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::Result;
use crate::types::TetherSettings;

/// Path of the user settings file: `~/.tether/settings.json`.
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
        .join("settings.json")
}

/// Deep-merge `overlay` onto `base`. Objects merge recursively; any other
/// value in `overlay` replaces the base value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                let _ = base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Load settings from the default path with env overrides applied.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific file path.
///
/// A missing file is not an error — defaults are used. A present but
/// malformed file is an error (the caller decides whether to fall back).
/// `TETHER_*` environment variables are applied last.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let file_value: Value = serde_json::from_str(&raw)?;
        deep_merge(defaults, file_value)
    } else {
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Apply `TETHER_*` environment variable overrides (highest priority).
fn apply_env_overrides(settings: &mut TetherSettings) {
    if let Ok(host) = std::env::var("TETHER_HOST") {
        settings.server.host = host;
    }
    if let Ok(port) = std::env::var("TETHER_PORT") {
        match port.parse() {
            Ok(port) => settings.server.port = port,
            Err(_) => tracing::warn!(value = %port, "TETHER_PORT is not a valid port, ignored"),
        }
    }
    if let Ok(base_url) = std::env::var("TETHER_BASE_URL") {
        settings.model.base_url = base_url;
    }
    if let Ok(api_key) = std::env::var("TETHER_API_KEY") {
        settings.model.api_key = api_key;
    }
    if let Ok(model_name) = std::env::var("TETHER_MODEL_NAME") {
        settings.model.model_name = model_name;
    }
    if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
        settings.logging.level = level;
    }
}
