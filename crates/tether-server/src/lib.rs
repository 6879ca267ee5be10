//! HTTP front of the tether orchestrator: run submission over SSE, thread
//! deletion, health, and server start-up.

pub mod config;
pub mod http;
pub mod orchestrator;
pub mod server;

pub use config::{ServerConfig, SessionLifetime};
pub use orchestrator::RunOrchestrator;
pub use server::{start, ServerHandle};
