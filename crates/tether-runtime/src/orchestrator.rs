//! Orchestrator — the single coordination point for agent lifecycle,
//! per-device exclusive access, and streaming sessions.
//!
//! The orchestrator is the sole mutator of lifecycle state. Everything
//! else (HTTP handlers, sessions) goes through it. It combines the
//! [`AgentRegistry`] and [`DeviceLockRegistry`] and tracks one abort token
//! per active streaming session — that table is the authoritative trigger
//! for cooperative cancellation.
//!
//! Construct once and share as `Arc<Orchestrator>`; see [`crate::global`]
//! for embedders that need a process-wide accessor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tether_core::{
    AgentBackend, AgentConfig, AgentMetadata, AgentState, BackendCallbacks, BackendError,
    BackendFactory, ModelConfig, StreamEvent,
};
use tether_settings::SessionSettings;

use crate::device_locks::DeviceLockRegistry;
use crate::errors::RuntimeError;
use crate::registry::{AgentRegistry, SharedBackend};
use crate::session::{SessionContext, StreamingSession, spawn_session};

/// Outcome of a single blocking run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    /// Final message from the backend.
    pub message: String,
    /// Steps executed.
    pub steps: u32,
    /// Success flag of the final step.
    pub success: bool,
}

/// Coordination point for device-bound agents.
pub struct Orchestrator {
    registry: AgentRegistry,
    locks: DeviceLockRegistry,
    factory: Arc<dyn BackendFactory>,
    /// Abort tokens of active streaming sessions, keyed by device key.
    sessions: Mutex<HashMap<String, CancellationToken>>,
    session_settings: SessionSettings,
}

impl Orchestrator {
    /// Create an orchestrator with default session tuning.
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self::with_settings(factory, SessionSettings::default())
    }

    /// Create an orchestrator with explicit session tuning.
    pub fn with_settings(factory: Arc<dyn BackendFactory>, session_settings: SessionSettings) -> Self {
        Self {
            registry: AgentRegistry::new(),
            locks: DeviceLockRegistry::new(),
            factory,
            sessions: Mutex::new(HashMap::new()),
            session_settings,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Initialize an agent for a device (idempotent absent `force`).
    ///
    /// With an existing entry and `force = false`, returns the existing
    /// handle unchanged — duplicate init calls never disrupt an in-flight
    /// conversation. Otherwise the handle is built via the backend factory
    /// and committed together with its configuration, or nothing is stored
    /// at all: any construction failure rolls back every partial mutation
    /// and surfaces as [`RuntimeError::AgentInitialization`].
    #[instrument(skip(self, model_config, agent_config, callbacks), fields(device_key = key))]
    pub fn initialize(
        &self,
        key: &str,
        model_config: ModelConfig,
        agent_config: AgentConfig,
        callbacks: BackendCallbacks,
        force: bool,
    ) -> Result<SharedBackend, RuntimeError> {
        if !force && self.registry.contains(key) {
            debug!(device_key = key, "agent already initialized");
            return self.registry.get(key);
        }

        // Refuse to (re)build under a caller currently holding the device.
        if self.locks.is_held(key) {
            return Err(RuntimeError::DeviceBusy(key.to_string()));
        }

        self.registry.set_state(key, AgentState::Initializing);

        match self.factory.build(&model_config, &agent_config, callbacks) {
            Ok(backend) => {
                let handle: SharedBackend = Arc::new(Mutex::new(backend));
                self.registry
                    .put(key, Arc::clone(&handle), model_config, agent_config);
                info!(device_key = key, "agent initialized");
                Ok(handle)
            }
            Err(err) => {
                // Rollback: no entry survives, only the error state.
                let _ = self.registry.remove(key);
                self.registry.set_error(key, err.message());
                error!(device_key = key, error = %err, "agent initialization failed");
                Err(RuntimeError::AgentInitialization {
                    key: key.to_string(),
                    message: err.message().to_string(),
                })
            }
        }
    }

    /// Get the handle for an initialized device.
    pub fn get(&self, key: &str) -> Result<SharedBackend, RuntimeError> {
        self.registry.get(key)
    }

    /// Whether an agent is initialized for the key.
    pub fn is_initialized(&self, key: &str) -> bool {
        self.registry.contains(key)
    }

    /// Current lifecycle state, if the key has ever been touched.
    pub fn state(&self, key: &str) -> Option<AgentState> {
        self.registry.state(key)
    }

    /// Metadata snapshot for an initialized device.
    pub fn metadata(&self, key: &str) -> Option<AgentMetadata> {
        self.registry.metadata(key)
    }

    /// All initialized device keys.
    pub fn list(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Metadata snapshots for all initialized devices.
    pub fn list_metadata(&self) -> Vec<AgentMetadata> {
        self.registry.list_metadata()
    }

    /// Rebuild the handle from cached configuration, discarding its
    /// accumulated conversational context and clearing any error.
    #[instrument(skip(self), fields(device_key = key))]
    pub fn reset(&self, key: &str) -> Result<(), RuntimeError> {
        let (model_config, agent_config) = self.registry.config(key)?;
        let backend = self
            .factory
            .build(&model_config, &agent_config, BackendCallbacks::default())
            .map_err(|err| RuntimeError::AgentInitialization {
                key: key.to_string(),
                message: err.message().to_string(),
            })?;
        self.registry.swap_handle(key, Arc::new(Mutex::new(backend)))?;
        info!(device_key = key, "agent reset");
        Ok(())
    }

    /// Merge new configuration over the cached pair and force-reinitialize.
    pub fn update_config(
        &self,
        key: &str,
        model_config: Option<ModelConfig>,
        agent_config: Option<AgentConfig>,
    ) -> Result<SharedBackend, RuntimeError> {
        let (cached_model, cached_agent) = self.registry.config(key)?;
        self.initialize(
            key,
            model_config.unwrap_or(cached_model),
            agent_config.unwrap_or(cached_agent),
            BackendCallbacks::default(),
            true,
        )
    }

    /// Destroy an agent: best-effort backend reset, then unconditional
    /// bookkeeping removal. Returns whether an entry existed.
    #[instrument(skip(self), fields(device_key = key))]
    pub fn destroy(&self, key: &str) -> bool {
        // An in-flight session loses its agent; tell it to stop. Its
        // reaper still owns releasing the device lock.
        if let Some(token) = self.sessions.lock().get(key) {
            token.cancel();
        }

        let Some(entry) = self.registry.remove(key) else {
            return false;
        };
        match entry.handle.try_lock() {
            Some(mut backend) => backend.reset(),
            None => warn!(device_key = key, "backend busy during destroy, skipping reset"),
        }
        info!(device_key = key, "agent destroyed");
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Exclusive access
    // ─────────────────────────────────────────────────────────────────────

    /// Acquire exclusive access to a device.
    ///
    /// `timeout`: `None` blocks, `Some(ZERO)` probes, `Some(d)` bounds the
    /// wait. On timeout, raises [`RuntimeError::DeviceBusy`] or returns
    /// `false` per `raise_on_timeout`.
    #[instrument(skip(self), fields(device_key = key))]
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Option<Duration>,
        raise_on_timeout: bool,
    ) -> Result<bool, RuntimeError> {
        if !self.registry.contains(key) {
            return Err(RuntimeError::AgentNotInitialized(key.to_string()));
        }

        if self.locks.try_acquire(key, timeout).await {
            self.registry.set_state(key, AgentState::Busy);
            self.registry.touch(key);
            Ok(true)
        } else if raise_on_timeout {
            Err(RuntimeError::DeviceBusy(key.to_string()))
        } else {
            Ok(false)
        }
    }

    /// Release exclusive access. Idempotent. Busy flips back to Idle;
    /// an Error state set while the lock was held survives the release.
    pub fn release(&self, key: &str) {
        if self.locks.release(key) && self.registry.state(key) == Some(AgentState::Busy) {
            self.registry.set_state(key, AgentState::Idle);
        }
    }

    /// Whether the device lock is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.is_held(key)
    }

    /// Run a caller-supplied blocking closure with exclusive access to the
    /// device's backend, releasing the lock on every exit path.
    ///
    /// A closure failure marks the device's metadata Error (with the
    /// failure message) before the release and before the error
    /// propagates.
    pub async fn scoped_use<F, T>(
        &self,
        key: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T, RuntimeError>
    where
        F: FnOnce(&mut dyn AgentBackend) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let _acquired = self.acquire(key, timeout, true).await?;

        let handle = match self.registry.get(key) {
            Ok(handle) => handle,
            Err(err) => {
                self.release(key);
                return Err(err);
            }
        };

        let join = tokio::task::spawn_blocking(move || {
            let mut backend = handle.lock();
            f(backend.as_mut())
        })
        .await;

        match join {
            Ok(Ok(value)) => {
                self.registry.touch(key);
                self.release(key);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.registry.set_error(key, err.message());
                self.release(key);
                Err(err.into())
            }
            Err(join_err) => {
                self.registry.set_error(key, &join_err.to_string());
                self.release(key);
                Err(RuntimeError::Internal(format!(
                    "scoped task failed: {join_err}"
                )))
            }
        }
    }

    /// Run one task to completion under the device lock, stepping until
    /// the backend reports finished or the configured step limit hits.
    /// The backend's per-run counter is reset before returning.
    #[instrument(skip(self, task), fields(device_key = key))]
    pub async fn run_task(
        &self,
        key: &str,
        task: &str,
        timeout: Option<Duration>,
    ) -> Result<RunOutcome, RuntimeError> {
        let (_, agent_config) = self.registry.config(key)?;
        let max_steps = agent_config.max_steps.max(1);
        let task = task.to_string();

        self.scoped_use(key, timeout, move |backend| {
            let mut input = Some(task);
            loop {
                let result = match backend.step(input.take().as_deref()) {
                    Ok(result) => result,
                    Err(err) => {
                        backend.reset();
                        return Err(err);
                    }
                };
                let steps = backend.step_count();
                if result.finished {
                    backend.reset();
                    return Ok(RunOutcome {
                        message: result.message,
                        steps,
                        success: result.success,
                    });
                }
                if steps >= max_steps {
                    backend.reset();
                    return Ok(RunOutcome {
                        message: "Max steps reached".to_string(),
                        steps,
                        success: result.success,
                    });
                }
            }
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streaming sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Start a streaming session for a task.
    ///
    /// Acquires the device lock and hands its release duty to the session:
    /// the lock is released only after the session's reaper has observed
    /// all step workers finished. The returned session's abort token is
    /// also registered so [`abort_session`](Self::abort_session) can
    /// trigger it.
    #[instrument(skip(self, task), fields(device_key = key))]
    pub async fn start_session(
        self: &Arc<Self>,
        key: &str,
        task: &str,
        timeout: Option<Duration>,
    ) -> Result<StreamingSession, RuntimeError> {
        let original = self.registry.get(key)?;
        let (model_config, agent_config) = self.registry.config(key)?;
        let _ = self.acquire(key, timeout, true).await?;

        let token = CancellationToken::new();
        let (events, receiver) = mpsc::channel(self.session_settings.channel_capacity.max(1));

        // Partial output flows straight into the event channel. Never
        // blocks; silently drops once abort is signaled or the consumer
        // is gone.
        let chunk_tx = events.clone();
        let chunk_token = token.clone();
        let callbacks = BackendCallbacks::with_thinking(Arc::new(move |chunk: &str| {
            if chunk_token.is_cancelled() {
                return;
            }
            if chunk_tx
                .try_send(StreamEvent::ThinkingChunk {
                    chunk: chunk.to_string(),
                })
                .is_err()
            {
                tracing::trace!("thinking chunk dropped: channel closed or full");
            }
        }));

        let streaming: SharedBackend =
            match self.factory.build(&model_config, &agent_config, callbacks) {
                Ok(backend) => Arc::new(Mutex::new(backend)),
                Err(err) => {
                    self.release(key);
                    return Err(RuntimeError::AgentInitialization {
                        key: key.to_string(),
                        message: err.message().to_string(),
                    });
                }
            };

        // Context handoff. The original is provably idle for the clone's
        // whole lifetime: its device lock is held and nothing else touches
        // it until the session completes.
        streaming.lock().restore(original.lock().snapshot());

        {
            let mut sessions = self.sessions.lock();
            let _ = sessions.insert(key.to_string(), token.clone());
            gauge!("device_sessions_active").set(sessions.len() as f64);
        }
        info!(device_key = key, "streaming session started");

        Ok(spawn_session(
            SessionContext {
                orchestrator: Arc::clone(self),
                device_key: key.to_string(),
                original,
                streaming,
                task: task.to_string(),
                max_steps: agent_config.max_steps.max(1),
                join_timeout: Duration::from_millis(self.session_settings.join_timeout_ms),
                token,
                events,
            },
            receiver,
        ))
    }

    /// Signal the active session for a device to abort. Returns whether a
    /// session was active.
    #[instrument(skip(self), fields(device_key = key))]
    pub fn abort_session(&self, key: &str) -> bool {
        let sessions = self.sessions.lock();
        if let Some(token) = sessions.get(key) {
            warn!(device_key = key, "session abort requested");
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Whether a streaming session is active for the device.
    pub fn has_active_session(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    /// Session cleanup: deregister the abort token and release the device
    /// lock. Called by the session driver after its reaper has observed
    /// all workers finished.
    pub(crate) fn finish_session(&self, key: &str) {
        {
            let mut sessions = self.sessions.lock();
            let _ = sessions.remove(key);
            gauge!("device_sessions_active").set(sessions.len() as f64);
        }
        self.release(key);
        debug!(device_key = key, "streaming session finished");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
