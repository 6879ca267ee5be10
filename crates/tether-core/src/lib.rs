//! Shared vocabulary for the tether workspace: identifiers, the run wire
//! protocol, outbound events and the model-session boundary.

pub mod events;
pub mod hooks;
pub mod ids;
pub mod protocol;
pub mod session;
pub mod tools;
