//! Boundary to the external model runtime.
//!
//! A [`ModelSession`] owns one conversational context. It accepts prompts,
//! calls installed tools while a turn runs, and reports progress to
//! subscribed listeners. Listeners are invoked inline, in emission order, so
//! a listener that pushes into a run's output queue observes text deltas
//! before any tool invoked after them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hooks::PreToolUseHook;
use crate::tools::SessionTool;

/// Progress reported by a model session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Incremental assistant text.
    MessageDelta { delta: String },
    /// The current turn is over and the session awaits a prompt.
    Idle,
    /// The current turn failed.
    Error { message: String },
}

pub type SessionListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by [`ModelSession::subscribe`]. Dropping it (or calling
/// [`Subscription::cancel`]) detaches the listener.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("prompt rejected: {0}")]
    Rejected(String),
    #[error("session closed")]
    Closed,
    #[error("{0}")]
    Backend(String),
}

/// Configuration applied when a session is created or resumed.
#[derive(Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub system_message: String,
    pub tools: Vec<SessionTool>,
    pub pre_tool_use: Arc<dyn PreToolUseHook>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

/// Entry returned by [`SessionBackend::list_sessions`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[async_trait]
pub trait ModelSession: Send + Sync {
    fn session_id(&self) -> &str;

    fn subscribe(&self, listener: SessionListener) -> Subscription;

    /// Submit a prompt. Returns once the session accepted it; the turn's
    /// outcome is reported through listeners.
    async fn send(&self, prompt: &str) -> Result<(), SessionError>;

    /// Stop the running turn, if any.
    async fn abort(&self) -> Result<(), SessionError>;

    /// Release the session permanently.
    async fn destroy(&self) -> Result<(), SessionError>;
}

/// Creates, lists and resumes model sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, SessionError>;

    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<dyn ModelSession>, SessionError>;

    /// Reattach to an existing session, keeping its conversation history.
    async fn resume_session(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Arc<dyn ModelSession>, SessionError>;
}
