use tether_core::ids::ToolCallId;
use tether_core::protocol::InputError;
use tether_core::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid run input: {0}")]
    InvalidInput(#[from] InputError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("prompt submission failed: {0}")]
    Submission(SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no pending tool call with id {0}")]
    Unknown(ToolCallId),
    #[error("tool call {0} is no longer awaiting a result")]
    Abandoned(ToolCallId),
}
