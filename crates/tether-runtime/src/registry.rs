//! Authoritative store of device key → (agent handle, cached configs,
//! metadata).
//!
//! All mutations run under one registry-wide lock with short critical
//! sections, so listing and state queries are linearizable across devices
//! and never block behind a long-running device-level hold. No public
//! method calls another while holding the guard.
//!
//! State outlives entries: a failed initialization leaves no entry (the
//! commit is all-or-nothing) but its `Error` state stays observable in a
//! side table until the key is destroyed or successfully re-initialized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use tether_core::{AgentBackend, AgentConfig, AgentMetadata, AgentState, ModelConfig};

use crate::errors::RuntimeError;

/// Shared handle to one agent backend.
///
/// The backend is single-writer: callers must hold the device lock before
/// taking the inner mutex for anything longer than bookkeeping.
pub type SharedBackend = Arc<Mutex<Box<dyn AgentBackend>>>;

/// One committed registry entry.
pub struct AgentEntry {
    /// The durable agent handle.
    pub handle: SharedBackend,
    /// Cached model configuration for rebuild-on-reset.
    pub model_config: ModelConfig,
    /// Cached agent configuration for rebuild-on-reset.
    pub agent_config: AgentConfig,
    /// Bookkeeping record.
    pub metadata: AgentMetadata,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, AgentEntry>,
    /// Lifecycle states, including keys whose initialization failed and
    /// therefore have no entry.
    states: HashMap<String, AgentState>,
}

/// Registry of initialized agents.
pub struct AgentRegistry {
    inner: Mutex<Inner>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Commit an entry: handle, config pair, and fresh metadata appear
    /// together or not at all. Replaces any previous entry for the key.
    pub fn put(
        &self,
        key: &str,
        handle: SharedBackend,
        model_config: ModelConfig,
        agent_config: AgentConfig,
    ) {
        let entry = AgentEntry {
            handle,
            model_config,
            agent_config,
            metadata: AgentMetadata::new(key),
        };
        let mut inner = self.inner.lock();
        let _ = inner.entries.insert(key.to_string(), entry);
        let _ = inner.states.insert(key.to_string(), AgentState::Idle);
        debug!(device_key = key, "agent entry committed");
    }

    /// Get the handle for a device.
    pub fn get(&self, key: &str) -> Result<SharedBackend, RuntimeError> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| RuntimeError::AgentNotInitialized(key.to_string()))
    }

    /// Detach an entry for caller-driven cleanup. Clears the side state.
    pub fn remove(&self, key: &str) -> Option<AgentEntry> {
        let mut inner = self.inner.lock();
        let _ = inner.states.remove(key);
        inner.entries.remove(key)
    }

    /// Whether an entry exists for the key.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Cached configuration pair for a device.
    pub fn config(&self, key: &str) -> Result<(ModelConfig, AgentConfig), RuntimeError> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| (entry.model_config.clone(), entry.agent_config.clone()))
            .ok_or_else(|| RuntimeError::AgentNotInitialized(key.to_string()))
    }

    /// Set the lifecycle state for a key. Valid even when no entry exists
    /// (Initializing before commit, Error after rollback).
    pub fn set_state(&self, key: &str, state: AgentState) {
        let mut inner = self.inner.lock();
        let _ = inner.states.insert(key.to_string(), state);
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.metadata.state = state;
        }
    }

    /// Mark a key errored with a message.
    pub fn set_error(&self, key: &str, message: &str) {
        let mut inner = self.inner.lock();
        let _ = inner.states.insert(key.to_string(), AgentState::Error);
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.metadata.state = AgentState::Error;
            entry.metadata.error_message = Some(message.to_string());
        }
    }

    /// Stamp last-used time.
    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.inner.lock().entries.get_mut(key) {
            entry.metadata.last_used_at = Utc::now();
        }
    }

    /// Replace the handle of an existing entry, clearing any error and
    /// returning the state to Idle. Configuration pair and creation time
    /// are preserved.
    pub fn swap_handle(&self, key: &str, handle: SharedBackend) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return Err(RuntimeError::AgentNotInitialized(key.to_string()));
        };
        entry.handle = handle;
        entry.metadata.state = AgentState::Idle;
        entry.metadata.error_message = None;
        entry.metadata.last_used_at = Utc::now();
        let _ = inner.states.insert(key.to_string(), AgentState::Idle);
        Ok(())
    }

    /// Current lifecycle state, if the key has ever been touched.
    pub fn state(&self, key: &str) -> Option<AgentState> {
        self.inner.lock().states.get(key).copied()
    }

    /// Metadata snapshot for a live entry.
    pub fn metadata(&self, key: &str) -> Option<AgentMetadata> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.metadata.clone())
    }

    /// All initialized device keys.
    pub fn list(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Metadata snapshots for all live entries.
    pub fn list_metadata(&self) -> Vec<AgentMetadata> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.metadata.clone())
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
