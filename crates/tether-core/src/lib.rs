//! # tether-core
//!
//! Core types for device-bound agent coordination.
//!
//! - **Events**: [`StepResult`] and the [`StreamEvent`] wire enum published
//!   by a streaming session.
//! - **State**: [`AgentState`] lifecycle enum and [`AgentMetadata`]
//!   bookkeeping record.
//! - **Backend**: the [`AgentBackend`] capability trait the coordination
//!   layer drives, plus [`BackendFactory`] for constructing instances.
//! - **Config**: [`ModelConfig`] / [`AgentConfig`] immutable value objects
//!   cached alongside each handle for rebuild-on-reset.
//!
//! ## Crate Position
//!
//! Leaf crate. Depends only on serde, chrono, thiserror.
//! Depended on by: tether-runtime, tether-server.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod events;
pub mod state;

pub use backend::{
    AgentBackend, BackendCallbacks, BackendError, BackendFactory, ContextSnapshot,
};
pub use config::{AgentConfig, ModelConfig};
pub use events::{StepResult, StreamEvent};
pub use state::{AgentMetadata, AgentState};
