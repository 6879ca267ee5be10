//! Run orchestrator: turns one run input into one outbound event stream.
//!
//! A run either submits a new prompt to the thread's session or resumes a
//! suspended client tool call. Session events are pushed into the run's
//! sink by a listener that is attached before anything can make the session
//! progress, and detached when the sink closes.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tether_core::events::RunEvent;
use tether_core::ids::{ThreadId, ToolCallId};
use tether_core::protocol::{RunCause, RunInput, ToolLocation};
use tether_core::session::{SessionConfig, SessionEvent, SessionListener, Subscription};
use tether_engine::hooks::LocationAwareHook;
use tether_engine::prompt::{build_system_message, fallback_prompt};
use tether_engine::streams::RunSink;
use tether_engine::tools::ToolAdapter;
use tether_engine::{EngineError, RunRegistries};
use tokio::task::JoinError;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ServerConfig, SessionLifetime};

/// Registry counts reported by `GET /health`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub sessions: usize,
    pub pending_tool_calls: usize,
    pub active_streams: usize,
}

enum Next {
    Event(Option<RunEvent>),
    Driver(Result<(), JoinError>),
}

pub struct RunOrchestrator {
    registries: Arc<RunRegistries>,
    config: ServerConfig,
}

impl RunOrchestrator {
    pub fn new(registries: Arc<RunRegistries>, config: ServerConfig) -> Self {
        Self { registries, config }
    }

    pub fn registries(&self) -> &Arc<RunRegistries> {
        &self.registries
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Event stream of one run. Nothing happens until the stream is polled.
    /// It ends right after the first terminal event; dropping it early
    /// detaches the run's listener but leaves the model turn running.
    pub fn run(self: &Arc<Self>, input: RunInput) -> impl Stream<Item = RunEvent> + Send + 'static {
        let this = Arc::clone(self);
        async_stream::stream! {
            let (sink, mut rx) = RunSink::channel(input.thread_id.clone(), input.run_id.clone());
            let mut driver = tokio::spawn(this.drive(input, sink.clone()));
            let mut driver_done = false;

            loop {
                let next = tokio::select! {
                    biased;
                    event = rx.recv() => Next::Event(event),
                    joined = &mut driver, if !driver_done => Next::Driver(joined),
                };
                match next {
                    Next::Event(Some(event)) => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Next::Event(None) => break,
                    Next::Driver(Ok(())) => driver_done = true,
                    Next::Driver(Err(e)) => {
                        driver_done = true;
                        error!(error = %e, "run driver crashed");
                        sink.fail("internal error: run aborted");
                    }
                }
            }
        }
    }

    async fn drive(self: Arc<Self>, input: RunInput, sink: RunSink) {
        sink.emit(RunEvent::RunStarted {
            thread_id: input.thread_id.clone(),
            run_id: input.run_id.clone(),
        });
        let cause = match input.cause() {
            Ok(cause) => cause,
            Err(e) => {
                sink.fail(EngineError::from(e).to_string());
                return;
            }
        };
        let span = info_span!(
            "run",
            thread_id = %input.thread_id,
            run_id = %input.run_id,
            cause = cause.kind()
        );
        self.drive_run(input, cause, sink).instrument(span).await;
    }

    async fn drive_run(&self, input: RunInput, cause: RunCause, sink: RunSink) {
        let thread_id = input.thread_id.clone();
        if let Some(snapshot) = input.state.clone() {
            if self.registries.state.seed(&thread_id, snapshot) {
                debug!("state mirror seeded from client snapshot");
            }
        }

        let attached = match cause {
            RunCause::Resumption { tool_call_id, result } => {
                match self.resume(&thread_id, &tool_call_id, &result, &sink) {
                    Some(subscription) => Ok(subscription),
                    None => {
                        let prompt = fallback_prompt(&tool_call_id, &result);
                        self.submit(&input, &prompt, &sink).await
                    }
                }
            }
            RunCause::FreshTurn { prompt } => self.submit(&input, &prompt, &sink).await,
        };

        match attached {
            Ok(subscription) => {
                sink.closed().await;
                subscription.cancel();
                debug!(finished = !sink.is_open(), "run stream closed");
            }
            Err(e) => {
                error!(error = %e, "run failed");
                sink.fail(e.to_string());
            }
        }

        if self.config.session_lifetime == SessionLifetime::PerRun {
            // A newer run on this thread owns the session now.
            if self.registries.streams.current_run_id(&thread_id).as_ref() != Some(sink.run_id()) {
                debug!("session kept for the thread's newer run");
                return;
            }
            self.registries.sessions.release(&thread_id).await;
            let cancelled = self.registries.pending.cancel_thread(&thread_id);
            debug!(cancelled, "per-run session released");
        }
    }

    /// Hand the result to the suspended tool call. Listener and stream are
    /// attached before the slot is filled so the turn cannot go idle
    /// unobserved. `None` means the suspension is gone and the caller must
    /// fall back to a fresh prompt.
    fn resume(
        &self,
        thread_id: &ThreadId,
        tool_call_id: &ToolCallId,
        result: &str,
        sink: &RunSink,
    ) -> Option<Subscription> {
        if !self.registries.pending.contains(tool_call_id) {
            info!(tool_call_id = %tool_call_id, "no pending tool call, falling back to a fresh prompt");
            return None;
        }
        let Some(session) = self.registries.sessions.get(thread_id) else {
            // Nothing can wake this suspension any more.
            self.registries.pending.discard(tool_call_id);
            info!(tool_call_id = %tool_call_id, "no live session, falling back to a fresh prompt");
            return None;
        };

        let subscription = session.subscribe(forward_to(sink));
        self.registries.streams.bind(sink.clone());
        match self.registries.pending.resolve(tool_call_id, result.to_string()) {
            Ok(()) => {
                info!(tool_call_id = %tool_call_id, "tool call resumed");
                Some(subscription)
            }
            Err(e) => {
                warn!(error = %e, "resume failed, falling back to a fresh prompt");
                subscription.cancel();
                None
            }
        }
    }

    async fn submit(
        &self,
        input: &RunInput,
        prompt: &str,
        sink: &RunSink,
    ) -> Result<Subscription, EngineError> {
        let thread_id = &input.thread_id;
        let with_state = input.state.is_some()
            || self.config.always_expose_state_tools
            || self.registries.state.contains(thread_id);
        let session = self
            .registries
            .sessions
            .get_or_create(thread_id, || self.session_config(input, with_state))
            .await?;

        let subscription = session.subscribe(forward_to(sink));
        self.registries.streams.bind(sink.clone());
        session.send(prompt).await.map_err(EngineError::Submission)?;
        debug!(prompt_len = prompt.len(), "prompt submitted");
        Ok(subscription)
    }

    fn session_config(&self, input: &RunInput, with_state: bool) -> SessionConfig {
        let tools = ToolAdapter::new(input.thread_id.clone(), &self.registries).adapt(&input.tools, with_state);
        let client_tools = tools
            .iter()
            .filter(|t| t.location == ToolLocation::Client)
            .map(|t| t.name.clone());
        SessionConfig {
            session_id: input.thread_id.to_string(),
            system_message: build_system_message(&self.config.system_message, with_state),
            pre_tool_use: Arc::new(LocationAwareHook::new(client_tools)),
            tools,
        }
    }

    /// Destroy the thread's session and drop everything kept for it.
    /// Returns false when no session was cached.
    pub async fn delete_thread(&self, thread_id: &ThreadId) -> Result<bool, EngineError> {
        let cancelled = self.registries.pending.cancel_thread(thread_id);
        if let Some(sink) = self.registries.streams.current(thread_id) {
            sink.fail("thread deleted");
        }
        self.registries.streams.unbind(thread_id);
        self.registries.state.clear(thread_id);
        let removed = self.registries.sessions.remove(thread_id).await?;
        info!(thread_id = %thread_id, removed, cancelled, "thread deleted");
        Ok(removed)
    }

    /// Evict suspensions older than `ttl`; their tool handlers fail.
    pub fn sweep_pending(&self, ttl: Duration) -> Vec<ToolCallId> {
        self.registries.pending.evict_older_than(ttl)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "healthy",
            sessions: self.registries.sessions.len(),
            pending_tool_calls: self.registries.pending.len(),
            active_streams: self.registries.streams.open_count(),
        }
    }
}

/// Session listener pushing into a run's sink, in emission order.
fn forward_to(sink: &RunSink) -> SessionListener {
    let sink = sink.clone();
    Arc::new(move |event: &SessionEvent| match event {
        SessionEvent::MessageDelta { delta } => {
            sink.emit(RunEvent::TextDelta {
                delta: delta.clone(),
            });
        }
        SessionEvent::Idle => {
            sink.finish();
        }
        SessionEvent::Error { message } => {
            sink.fail(message.clone());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock, Weak};
    use tether_core::ids::RunId;
    use tether_core::protocol::{InputMessage, ToolDeclaration};
    use tether_core::session::{ModelSession, SessionBackend, SessionError, SessionMetadata};
    use tether_engine::scripted::{Script, ScriptStep, ScriptedBackend};

    fn orchestrator(backend: Arc<dyn SessionBackend>, config: ServerConfig) -> Arc<RunOrchestrator> {
        Arc::new(RunOrchestrator::new(Arc::new(RunRegistries::new(backend)), config))
    }

    fn user_run(thread: &str, run: &str, text: &str) -> RunInput {
        RunInput::new(ThreadId::from_raw(thread), RunId::from_raw(run))
            .with_message(InputMessage::user(text))
            .with_tool(ToolDeclaration::client("fetch_weather", "Current weather for a city"))
    }

    fn tool_result_run(thread: &str, run: &str, call: &ToolCallId, result: &str) -> RunInput {
        RunInput::new(ThreadId::from_raw(thread), RunId::from_raw(run))
            .with_message(InputMessage::user("weather in Lyon?"))
            .with_message(InputMessage::tool_result(call.clone(), result))
            .with_tool(ToolDeclaration::client("fetch_weather", "Current weather for a city"))
    }

    async fn collect(orch: &Arc<RunOrchestrator>, input: RunInput) -> Vec<RunEvent> {
        tokio::time::timeout(Duration::from_secs(5), orch.run(input).collect::<Vec<_>>())
            .await
            .expect("run should terminate")
    }

    fn types(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(RunEvent::event_type).collect()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn fresh_turn_streams_text_then_finishes() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::steps([
            ScriptStep::text("Hel"),
            ScriptStep::text("lo"),
        ])]));
        let orch = orchestrator(backend, ServerConfig::default());

        let events = collect(&orch, user_run("t1", "r1", "hello")).await;
        assert_eq!(types(&events), ["run-started", "text-delta", "text-delta", "run-finished"]);
        assert_eq!(
            events[0],
            RunEvent::RunStarted {
                thread_id: ThreadId::from_raw("t1"),
                run_id: RunId::from_raw("r1")
            }
        );
        assert_eq!(events[1], RunEvent::TextDelta { delta: "Hel".into() });
        assert_eq!(orch.registries().sessions.len(), 1);
    }

    #[tokio::test]
    async fn client_tool_hands_off_and_resumes_same_session() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::steps([
            ScriptStep::text("Checking. "),
            ScriptStep::call("fetch_weather", json!({"city": "Lyon"})),
            ScriptStep::text("It is 18C in Lyon."),
        ])]));
        let orch = orchestrator(backend.clone(), ServerConfig::default());

        let first = collect(&orch, user_run("t1", "r1", "weather in Lyon?")).await;
        assert_eq!(types(&first), ["run-started", "text-delta", "tool-call-dispatch", "run-finished"]);
        let RunEvent::ToolCallDispatch { tool_call_id, tool_name, arguments } = &first[2] else {
            panic!("expected dispatch");
        };
        assert_eq!(tool_name, "fetch_weather");
        assert_eq!(serde_json::from_str::<serde_json::Value>(arguments).unwrap(), json!({"city": "Lyon"}));
        assert!(orch.registries().pending.contains(tool_call_id));

        let second = collect(&orch, tool_result_run("t1", "r2", tool_call_id, "18C")).await;
        assert_eq!(types(&second), ["run-started", "text-delta", "run-finished"]);
        assert_eq!(second[1], RunEvent::TextDelta { delta: "It is 18C in Lyon.".into() });
        assert_eq!(
            second[2],
            RunEvent::RunFinished {
                thread_id: ThreadId::from_raw("t1"),
                run_id: RunId::from_raw("r2")
            }
        );

        assert!(orch.registries().pending.is_empty());
        assert_eq!(backend.created(), 1);
        assert!(backend
            .transcript("t1")
            .unwrap()
            .contains(&"tool fetch_weather returned: 18C".to_string()));
    }

    #[tokio::test]
    async fn unknown_tool_call_falls_back_to_prompt() {
        let orch = orchestrator(Arc::new(ScriptedBackend::echo()), ServerConfig::default());
        let ghost = ToolCallId::from_raw("call_ghost");

        let events = collect(&orch, tool_result_run("t1", "r1", &ghost, "18C")).await;
        assert_eq!(types(&events), ["run-started", "text-delta", "run-finished"]);
        let RunEvent::TextDelta { delta } = &events[1] else {
            panic!("expected text");
        };
        assert!(delta.contains("call_ghost"));
        assert!(delta.contains("18C"));
    }

    #[tokio::test]
    async fn pending_without_session_falls_back() {
        let orch = orchestrator(Arc::new(ScriptedBackend::echo()), ServerConfig::default());
        let orphan = ToolCallId::from_raw("call_orphan");
        let _slot = orch
            .registries()
            .pending
            .register(orphan.clone(), ThreadId::from_raw("t9"), "fetch_weather");

        let events = collect(&orch, tool_result_run("t9", "r1", &orphan, "18C")).await;
        assert_eq!(types(&events), ["run-started", "text-delta", "run-finished"]);
        let RunEvent::TextDelta { delta } = &events[1] else {
            panic!("expected text");
        };
        assert!(delta.contains("call_orphan"));
        assert!(orch.registries().pending.is_empty());
    }

    #[tokio::test]
    async fn rejected_submission_ends_with_run_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::reject("quota exceeded")]));
        let orch = orchestrator(backend, ServerConfig::default());

        let events = collect(&orch, user_run("t1", "r1", "hello")).await;
        assert_eq!(types(&events), ["run-started", "run-error"]);
        let RunEvent::RunError { message } = &events[1] else {
            panic!("expected error");
        };
        assert!(message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn failing_turn_ends_with_run_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::steps([
            ScriptStep::text("partial"),
            ScriptStep::Fail("model overloaded".into()),
        ])]));
        let orch = orchestrator(backend, ServerConfig::default());

        let events = collect(&orch, user_run("t1", "r1", "hello")).await;
        assert_eq!(types(&events), ["run-started", "text-delta", "run-error"]);
        assert_eq!(events[2], RunEvent::RunError { message: "model overloaded".into() });
    }

    #[tokio::test]
    async fn invalid_input_ends_with_run_error() {
        let orch = orchestrator(Arc::new(ScriptedBackend::echo()), ServerConfig::default());
        let input = RunInput::new(ThreadId::from_raw("t1"), RunId::from_raw("r1"))
            .with_message(InputMessage::assistant("no user message here"));
        let events = collect(&orch, input).await;
        assert_eq!(types(&events), ["run-started", "run-error"]);
    }

    #[tokio::test]
    async fn state_tool_forwards_delta_on_the_run_stream() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::steps([
            ScriptStep::call("update_state", json!({"state": {"todos": ["buy milk"]}})),
            ScriptStep::text("Added."),
        ])]));
        let orch = orchestrator(backend, ServerConfig::default());
        let input = user_run("t1", "r1", "add milk").with_state(json!({"todos": []}));

        let events = collect(&orch, input).await;
        assert_eq!(
            types(&events),
            ["run-started", "tool-call-dispatch", "state-delta", "text-delta", "run-finished"]
        );
        let RunEvent::StateDelta { delta } = &events[2] else {
            panic!("expected state delta");
        };
        assert!(!delta.is_empty());
        assert!(delta.iter().all(|op| op["path"].as_str().is_some_and(|p| p.starts_with("/todos"))));
        assert_eq!(
            orch.registries().state.snapshot(&ThreadId::from_raw("t1")),
            Some(json!({"todos": ["buy milk"]}))
        );
    }

    #[tokio::test]
    async fn per_run_lifetime_releases_session() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::reply("hi"), Script::reply("again")]));
        let config = ServerConfig {
            session_lifetime: SessionLifetime::PerRun,
            ..ServerConfig::default()
        };
        let orch = orchestrator(backend.clone(), config);

        collect(&orch, user_run("t1", "r1", "hello")).await;
        let registries = Arc::clone(orch.registries());
        eventually(|| registries.sessions.is_empty()).await;

        let events = collect(&orch, user_run("t1", "r2", "hello again")).await;
        assert_eq!(types(&events), ["run-started", "text-delta", "run-finished"]);
        assert_eq!(backend.created(), 1);
        assert_eq!(backend.resumed(), 1);
    }

    #[tokio::test]
    async fn per_run_cleanup_spares_newer_run() {
        let call = ToolCallId::from_raw("unused");
        let session = RecordingSession::new(call);
        let config = ServerConfig {
            session_lifetime: SessionLifetime::PerRun,
            ..ServerConfig::default()
        };
        let orch = orchestrator(Arc::new(RecordingBackend(Arc::clone(&session))), config);
        let thread = ThreadId::from_raw("t1");

        let mut older = Box::pin(orch.run(user_run("t1", "r1", "first")));
        assert_eq!(older.next().await.map(|e| e.event_type()), Some("run-started"));
        eventually(|| session.listener_count() == 1).await;

        // r2 takes over the cached session before r1 winds down.
        let mut newer = Box::pin(orch.run(user_run("t1", "r2", "second")));
        assert_eq!(newer.next().await.map(|e| e.event_type()), Some("run-started"));
        let registries = Arc::clone(orch.registries());
        let bound = thread.clone();
        eventually(move || registries.streams.current_run_id(&bound).is_some_and(|r| r.as_str() == "r2")).await;

        drop(older);
        eventually(|| session.listener_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(orch.registries().sessions.len(), 1);

        session.emit(SessionEvent::Idle);
        assert_eq!(newer.next().await.map(|e| e.event_type()), Some("run-finished"));
        let registries = Arc::clone(orch.registries());
        eventually(move || registries.sessions.is_empty()).await;
        assert_eq!(session.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_thread_cancels_suspension() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::steps([ScriptStep::call(
            "fetch_weather",
            json!({"city": "Lyon"}),
        )])]));
        let orch = orchestrator(backend.clone(), ServerConfig::default());
        let thread = ThreadId::from_raw("t1");

        let events = collect(&orch, user_run("t1", "r1", "weather?").with_state(json!({"a": 1}))).await;
        assert_eq!(types(&events), ["run-started", "tool-call-dispatch", "run-finished"]);
        assert_eq!(orch.registries().pending.len(), 1);

        assert!(orch.delete_thread(&thread).await.unwrap());
        assert!(orch.registries().pending.is_empty());
        assert!(!orch.registries().state.contains(&thread));
        assert!(backend.transcript("t1").is_none());
        assert!(!orch.delete_thread(&thread).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_evicts_stale_suspensions() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::steps([ScriptStep::call(
            "fetch_weather",
            json!({}),
        )])]));
        let orch = orchestrator(backend.clone(), ServerConfig::default());
        collect(&orch, user_run("t1", "r1", "weather?")).await;

        assert!(orch.sweep_pending(Duration::from_secs(3600)).is_empty());
        assert_eq!(orch.sweep_pending(Duration::ZERO).len(), 1);
        assert_eq!(orch.health().pending_tool_calls, 0);

        let transcript = backend.clone();
        eventually(move || {
            transcript
                .transcript("t1")
                .is_some_and(|lines| lines.iter().any(|l| l.starts_with("tool fetch_weather failed")))
        })
        .await;
    }

    /// Session that records what the registries looked like when a listener
    /// attached, and goes idle as soon as its suspended call is resolved.
    struct RecordingSession {
        registries: OnceLock<Weak<RunRegistries>>,
        watched: ToolCallId,
        listeners: Arc<Mutex<Vec<(usize, SessionListener)>>>,
        next_id: AtomicUsize,
        pending_at_subscribe: Mutex<Vec<bool>>,
        aborts: AtomicUsize,
    }

    impl RecordingSession {
        fn new(watched: ToolCallId) -> Arc<Self> {
            Arc::new(Self {
                registries: OnceLock::new(),
                watched,
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_id: AtomicUsize::new(0),
                pending_at_subscribe: Mutex::new(Vec::new()),
                aborts: AtomicUsize::new(0),
            })
        }

        fn emit(&self, event: SessionEvent) {
            let listeners: Vec<_> = self.listeners.lock().unwrap().iter().map(|(_, l)| Arc::clone(l)).collect();
            for l in listeners {
                l(&event);
            }
        }

        fn listener_count(&self) -> usize {
            self.listeners.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelSession for RecordingSession {
        fn session_id(&self) -> &str {
            "t1"
        }

        fn subscribe(&self, listener: SessionListener) -> Subscription {
            let pending = self
                .registries
                .get()
                .and_then(Weak::upgrade)
                .is_some_and(|r| r.pending.contains(&self.watched));
            self.pending_at_subscribe.lock().unwrap().push(pending);

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.listeners.lock().unwrap().push((id, listener));
            let listeners = Arc::clone(&self.listeners);
            Subscription::new(move || listeners.lock().unwrap().retain(|(i, _)| *i != id))
        }

        async fn send(&self, _prompt: &str) -> Result<(), SessionError> {
            Ok(())
        }

        async fn abort(&self) -> Result<(), SessionError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn destroy(&self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct RecordingBackend(Arc<RecordingSession>);

    #[async_trait]
    impl SessionBackend for RecordingBackend {
        async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, SessionError> {
            Ok(Vec::new())
        }

        async fn create_session(&self, _config: SessionConfig) -> Result<Arc<dyn ModelSession>, SessionError> {
            Ok(Arc::clone(&self.0) as Arc<dyn ModelSession>)
        }

        async fn resume_session(
            &self,
            _session_id: &str,
            config: SessionConfig,
        ) -> Result<Arc<dyn ModelSession>, SessionError> {
            self.create_session(config).await
        }
    }

    async fn recording_setup(watched: &ToolCallId) -> (Arc<RunOrchestrator>, Arc<RecordingSession>) {
        let session = RecordingSession::new(watched.clone());
        let orch = orchestrator(Arc::new(RecordingBackend(Arc::clone(&session))), ServerConfig::default());
        let _ = session.registries.set(Arc::downgrade(orch.registries()));
        orch.registries()
            .sessions
            .get_or_create(&ThreadId::from_raw("t1"), || orch.session_config(&user_run("t1", "r0", "x"), false))
            .await
            .unwrap();
        (orch, session)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_attaches_before_suspension_is_resolved() {
        let call = ToolCallId::from_raw("call_1");
        let (orch, session) = recording_setup(&call).await;

        // The suspended turn goes idle the instant its result lands.
        let slot = orch
            .registries()
            .pending
            .register(call.clone(), ThreadId::from_raw("t1"), "fetch_weather");
        let idle_on_resolve = Arc::clone(&session);
        tokio::spawn(async move {
            if slot.await.is_ok() {
                idle_on_resolve.emit(SessionEvent::Idle);
            }
        });

        let events = collect(&orch, tool_result_run("t1", "r1", &call, "18C")).await;
        assert_eq!(types(&events), ["run-started", "run-finished"]);
        assert_eq!(*session.pending_at_subscribe.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn disconnect_detaches_listener_without_abort() {
        let call = ToolCallId::from_raw("unused");
        let (orch, session) = recording_setup(&call).await;

        let mut stream = Box::pin(orch.run(user_run("t1", "r1", "hello")));
        assert_eq!(stream.next().await.map(|e| e.event_type()), Some("run-started"));
        eventually(|| session.listener_count() == 1).await;

        drop(stream);
        eventually(|| session.listener_count() == 0).await;
        assert_eq!(session.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(orch.registries().sessions.len(), 1);
    }
}
