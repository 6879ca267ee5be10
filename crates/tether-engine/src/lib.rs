//! Orchestration state shared by every run of a server instance: the
//! session, pending tool-call and active stream registries, the tool adapter
//! and the shared-state reconciler.

pub mod error;
pub mod hooks;
pub mod pending;
pub mod prompt;
pub mod registries;
pub mod scripted;
pub mod sessions;
pub mod state;
pub mod streams;
pub mod tools;

pub use error::{EngineError, ResolveError};
pub use registries::RunRegistries;
