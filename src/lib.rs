//! muxcrew - multi-agent orchestration for interactive AI CLIs running in
//! terminal-multiplexer sessions.
//!
//! An orchestrator dispatches prompts to per-agent controllers, enforces
//! turn-taking, tracks consensus and conflict, and relinquishes control
//! whenever a human attaches to one of the sessions. The session transport
//! itself lives in the `mux-session` crate.

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod parser;
pub mod restart;
pub mod transcript;
pub mod utils;

pub use controller::{AgentController, ControllerState, ControllerStatus};
pub use error::CoreError;
pub use orchestrator::{DispatchSummary, Orchestrator};
