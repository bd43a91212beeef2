//! # tether-runtime
//!
//! Device-bound agent lifecycle, per-device locking, and streaming session
//! coordination.
//!
//! - **DeviceLockRegistry**: one exclusive lock per device key, created
//!   lazily, acquired with blocking/probing/bounded semantics.
//! - **AgentRegistry**: authoritative device key → (handle, cached
//!   configs, metadata) store, linearizable under one registry-wide lock.
//! - **Orchestrator**: the single coordination point — transactional
//!   initialize/rollback, scoped exclusive access, blocking runs,
//!   streaming session startup and abort.
//! - **StreamingSession**: one step at a time under an already-held device
//!   lock, ordered events, cooperative abort at step boundaries.
//!
//! ## Crate Position
//!
//! Aggregation layer. Depends on: tether-core, tether-settings.
//! Depended on by: tether-server.

#![deny(unsafe_code)]

pub mod device_locks;
pub mod errors;
pub mod global;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod testutil;

// Re-export main public API
pub use device_locks::DeviceLockRegistry;
pub use errors::RuntimeError;
pub use global::{global, global_or_init, init_global};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use registry::{AgentEntry, AgentRegistry, SharedBackend};
pub use session::StreamingSession;
