#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! codebroker library — exposes the core modules for use by the server binary.
//!
//! - `config` — configuration loading
//! - `sandbox` — the Sandbox Adapter contract and its Docker-backed implementation
//! - `stream` — output stream normalization and chunking
//! - `input` — inbound message validation
//! - `session` — session lifecycle and state machine
//! - `registry` — session registry, caps, and ownership tracking
//! - `health_gate` — per-connection sandbox-failure backoff
//! - `ws` — WebSocket protocol handling (connection handler)
//! - `routes` — REST route handlers (just `/health`)
//! - `error` — shared error taxonomy

pub mod config;
pub mod error;
pub mod health_gate;
pub mod input;
pub mod registry;
pub mod routes;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod stream;
pub mod ws;

pub use config::Config;
pub use error::BrokerError;
pub use registry::SessionRegistry;
pub use state::AppState;
