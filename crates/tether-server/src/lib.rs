//! # tether-server
//!
//! HTTP surface for the tether coordination core.
//!
//! Library crate: [`router`] builds an axum router over a shared
//! [`tether_runtime::Orchestrator`]; process wiring (listener, shutdown,
//! tracing subscriber) belongs to the embedding application.
//!
//! Routes:
//! - `POST /api/init` — initialize an agent for a device
//! - `POST /api/chat` — blocking run, steps until finished or limit
//! - `POST /api/chat/stream` — streaming run over SSE
//! - `POST /api/interrupt` — cooperative abort of an active session
//! - `POST /api/reset` — rebuild the agent from cached configuration
//! - `POST /api/destroy` — remove the agent
//! - `GET /api/status` — per-device or fleet status
//!
//! ## Crate Position
//!
//! Top layer. Depends on: tether-core, tether-settings, tether-runtime.

#![deny(unsafe_code)]

pub mod routes;
pub mod schemas;

pub use routes::{ApiError, AppState, router};
