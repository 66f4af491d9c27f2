//! Tether - interruptible agent sessions over a typed event stream
//!
//! Tether runs one coding-agent process per session turn, forwards its
//! output to clients as ordered `StreamEvent`s, pauses the agent while a
//! client decides on tool permissions, and provides a reconnecting client
//! consumer for the stream.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod doctor;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod ratelimit;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use agent::process::{AgentLauncher, CliLauncher};
pub use client::{ConnectionState, HttpTransport, StreamConsumer, StreamHandler, TurnOutcome};
pub use config::TetherConfig;
pub use error::{ConsumerError, OrchestratorError, PermissionError};
pub use orchestrator::{Orchestrator, OrchestratorSettings, SessionStreamState, StreamStatus};
pub use protocol::{PermissionDecision, PermissionOutcome, StartRequest, StreamEvent};
pub use ratelimit::RateLimiter;
pub use server::{build_app, AppState};
pub use store::{JsonlSessionStore, MemorySessionStore, SessionStore};
