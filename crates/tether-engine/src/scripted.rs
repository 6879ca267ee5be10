//! In-process model sessions driven by pre-programmed scripts.
//!
//! Each prompt pops the next [`Script`]. Steps stream text, call installed
//! tools (through the session's pre-tool-use hook) or fail the turn. When
//! the queue is exhausted the backend either echoes the prompt or rejects it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::hooks::HookDecision;
use tether_core::ids::ToolCallId;
use tether_core::session::{
    ModelSession, SessionBackend, SessionConfig, SessionError, SessionEvent, SessionListener,
    SessionMetadata, Subscription,
};
use tether_core::tools::ToolInvocation;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One action of a scripted turn.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptStep {
    /// Stream a text delta.
    Text(String),
    /// Call an installed tool and wait for its result.
    CallTool { name: String, arguments: Value },
    /// End the turn with an error event.
    Fail(String),
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn call(name: impl Into<String>, arguments: Value) -> Self {
        Self::CallTool {
            name: name.into(),
            arguments,
        }
    }
}

/// Response to one prompt.
#[derive(Clone, Debug, PartialEq)]
pub enum Script {
    Steps(Vec<ScriptStep>),
    /// Refuse the prompt at submission time.
    Reject(String),
}

impl Script {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Steps(vec![ScriptStep::text(text)])
    }

    pub fn steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self::Steps(steps.into_iter().collect())
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self::Reject(message.into())
    }
}

type Transcript = Arc<Mutex<Vec<String>>>;

/// Session backend with scripted responses shared by all its sessions.
pub struct ScriptedBackend {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    echo_when_exhausted: bool,
    transcripts: Arc<DashMap<String, Transcript>>,
    created: AtomicUsize,
    resumed: AtomicUsize,
}

impl ScriptedBackend {
    /// Backend that rejects prompts once `scripts` is exhausted.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            echo_when_exhausted: false,
            transcripts: Arc::new(DashMap::new()),
            created: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
        }
    }

    /// Backend that answers every prompt by echoing it back.
    pub fn echo() -> Self {
        Self {
            echo_when_exhausted: true,
            ..Self::new(Vec::new())
        }
    }

    /// Pretend a session with this id survives from an earlier process.
    pub fn with_existing_session(self, session_id: impl Into<String>) -> Self {
        self.transcripts
            .insert(session_id.into(), Arc::new(Mutex::new(Vec::new())));
        self
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::Relaxed)
    }

    /// Conversation log of a session, one `role: text` line per entry.
    pub fn transcript(&self, session_id: &str) -> Option<Vec<String>> {
        self.transcripts.get(session_id).map(|t| t.lock().clone())
    }

    fn open(&self, config: SessionConfig, transcript: Transcript) -> Arc<dyn ModelSession> {
        Arc::new(ScriptedSession {
            shared: Arc::new(SessionShared {
                id: config.session_id.clone(),
                config,
                scripts: Arc::clone(&self.scripts),
                echo_when_exhausted: self.echo_when_exhausted,
                transcripts: Arc::clone(&self.transcripts),
                transcript,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                turn: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, SessionError> {
        Ok(self
            .transcripts
            .iter()
            .map(|entry| SessionMetadata {
                session_id: entry.key().clone(),
                summary: entry.value().lock().first().cloned(),
            })
            .collect())
    }

    async fn create_session(&self, config: SessionConfig) -> Result<Arc<dyn ModelSession>, SessionError> {
        let transcript: Transcript = Arc::new(Mutex::new(Vec::new()));
        self.transcripts
            .insert(config.session_id.clone(), Arc::clone(&transcript));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(self.open(config, transcript))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Arc<dyn ModelSession>, SessionError> {
        let transcript = self
            .transcripts
            .get(session_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.resumed.fetch_add(1, Ordering::Relaxed);
        Ok(self.open(
            SessionConfig {
                session_id: session_id.to_string(),
                ..config
            },
            transcript,
        ))
    }
}

struct SessionShared {
    id: String,
    config: SessionConfig,
    scripts: Arc<Mutex<VecDeque<Script>>>,
    echo_when_exhausted: bool,
    transcripts: Arc<DashMap<String, Transcript>>,
    transcript: Transcript,
    listeners: Mutex<Vec<(u64, SessionListener)>>,
    next_listener: AtomicU64,
    turn: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SessionShared {
    /// Listeners run outside the lock so they may subscribe or unsubscribe.
    fn emit(&self, event: SessionEvent) {
        let listeners: Vec<SessionListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn record(&self, line: String) {
        self.transcript.lock().push(line);
    }

    async fn run_turn(self: Arc<Self>, steps: Vec<ScriptStep>) {
        for step in steps {
            tokio::task::yield_now().await;
            match step {
                ScriptStep::Text(text) => {
                    self.record(format!("assistant: {text}"));
                    self.emit(SessionEvent::MessageDelta { delta: text });
                }
                ScriptStep::CallTool { name, arguments } => self.call_tool(name, arguments).await,
                ScriptStep::Fail(message) => {
                    self.record(format!("error: {message}"));
                    self.emit(SessionEvent::Error { message });
                    return;
                }
            }
        }
        self.emit(SessionEvent::Idle);
    }

    async fn call_tool(&self, name: String, arguments: Value) {
        let call = ToolInvocation {
            tool_call_id: ToolCallId::new(),
            tool_name: name.clone(),
            arguments,
        };
        match self.config.pre_tool_use.before_tool_use(&call).await {
            HookDecision::Deny { reason } => {
                self.record(format!("tool {name} denied: {reason}"));
                return;
            }
            HookDecision::Allow { additional_context } => {
                if let Some(context) = additional_context {
                    self.record(format!("system: {context}"));
                }
            }
        }

        let Some(tool) = self.config.tools.iter().find(|t| t.name == name) else {
            warn!(session_id = %self.id, tool_name = %name, "script called an uninstalled tool");
            self.record(format!("tool {name} failed: not installed"));
            return;
        };
        debug!(session_id = %self.id, tool_call_id = %call.tool_call_id, tool_name = %name, "invoking tool");
        let result = tool.handler.invoke(call).await;
        let outcome = if result.is_error { "failed" } else { "returned" };
        self.record(format!("tool {name} {outcome}: {}", result.content));
    }

    fn next_script(&self, prompt: &str) -> Result<Vec<ScriptStep>, SessionError> {
        match self.scripts.lock().pop_front() {
            Some(Script::Steps(steps)) => Ok(steps),
            Some(Script::Reject(message)) => Err(SessionError::Rejected(message)),
            None if self.echo_when_exhausted => Ok(vec![ScriptStep::Text(format!("You said: {prompt}"))]),
            None => Err(SessionError::Rejected("no scripted response left".into())),
        }
    }
}

/// A model session whose turns run as spawned tasks.
pub struct ScriptedSession {
    shared: Arc<SessionShared>,
}

#[async_trait]
impl ModelSession for ScriptedSession {
    fn session_id(&self) -> &str {
        &self.shared.id
    }

    fn subscribe(&self, listener: SessionListener) -> Subscription {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.lock().push((id, listener));
        let shared: Weak<SessionShared> = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    async fn send(&self, prompt: &str) -> Result<(), SessionError> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let mut turn = self.shared.turn.lock();
        if turn.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(SessionError::Rejected("a turn is already in progress".into()));
        }
        let steps = self.shared.next_script(prompt)?;
        self.shared.record(format!("user: {prompt}"));
        *turn = Some(tokio::spawn(Arc::clone(&self.shared).run_turn(steps)));
        Ok(())
    }

    async fn abort(&self) -> Result<(), SessionError> {
        if let Some(turn) = self.shared.turn.lock().take() {
            turn.abort();
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), SessionError> {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Closed);
        }
        self.abort().await?;
        self.shared.listeners.lock().clear();
        self.shared.transcripts.remove(&self.shared.id);
        Ok(())
    }
}
