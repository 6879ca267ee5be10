//! Per-run output queues and the thread → stream routing table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tether_core::events::RunEvent;
use tether_core::ids::{RunId, ThreadId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct SinkInner {
    thread_id: ThreadId,
    run_id: RunId,
    tx: mpsc::UnboundedSender<RunEvent>,
    terminated: AtomicBool,
    done: CancellationToken,
}

/// Write side of one run's event queue. Emission is synchronous so session
/// listeners can push from inside the session's own call stack, preserving
/// emission order. The run is over once a terminal event has been pushed or
/// the reader has gone away.
#[derive(Clone)]
pub struct RunSink {
    inner: Arc<SinkInner>,
}

impl RunSink {
    pub fn channel(thread_id: ThreadId, run_id: RunId) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            inner: Arc::new(SinkInner {
                thread_id,
                run_id,
                tx,
                terminated: AtomicBool::new(false),
                done: CancellationToken::new(),
            }),
        };
        (sink, rx)
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.inner.thread_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    /// Push a non-terminal event. Returns false once the run is over.
    pub fn emit(&self, event: RunEvent) -> bool {
        if self.inner.terminated.load(Ordering::Acquire) {
            return false;
        }
        self.inner.tx.send(event).is_ok()
    }

    /// Push `run-finished`. Only the first terminal event wins.
    pub fn finish(&self) -> bool {
        self.terminate(RunEvent::RunFinished {
            thread_id: self.inner.thread_id.clone(),
            run_id: self.inner.run_id.clone(),
        })
    }

    /// Push `run-error`. Only the first terminal event wins.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.terminate(RunEvent::RunError {
            message: message.into(),
        })
    }

    fn terminate(&self, event: RunEvent) -> bool {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(
            thread_id = %self.inner.thread_id,
            run_id = %self.inner.run_id,
            event = event.event_type(),
            "run stream terminated"
        );
        let sent = self.inner.tx.send(event).is_ok();
        self.inner.done.cancel();
        sent
    }

    pub fn is_open(&self) -> bool {
        !self.inner.terminated.load(Ordering::Acquire) && !self.inner.tx.is_closed()
    }

    /// Resolves when a terminal event was pushed or the reader disconnected.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.inner.done.cancelled() => {}
            _ = self.inner.tx.closed() => {}
        }
    }
}

/// Routing table: which run's stream receives events for a thread.
///
/// Last writer wins. Two genuinely concurrent runs on one thread are not
/// reconciled; the older stream simply stops receiving tool events.
#[derive(Default)]
pub struct ActiveStreams {
    bindings: DashMap<ThreadId, RunSink>,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `sink` as the thread's active stream, returning the binding it replaced.
    pub fn bind(&self, sink: RunSink) -> Option<RunSink> {
        let previous = self.bindings.insert(sink.thread_id().clone(), sink.clone());
        if let Some(prev) = &previous {
            if prev.is_open() && prev.run_id() != sink.run_id() {
                warn!(
                    thread_id = %sink.thread_id(),
                    superseded_run = %prev.run_id(),
                    run_id = %sink.run_id(),
                    "active stream rebound while previous run still open"
                );
            }
        }
        previous
    }

    /// The thread's current binding, if its run is still open.
    pub fn current(&self, thread_id: &ThreadId) -> Option<RunSink> {
        self.bindings
            .get(thread_id)
            .map(|entry| entry.value().clone())
            .filter(RunSink::is_open)
    }

    pub fn current_run_id(&self, thread_id: &ThreadId) -> Option<RunId> {
        self.bindings.get(thread_id).map(|entry| entry.run_id().clone())
    }

    pub fn unbind(&self, thread_id: &ThreadId) -> bool {
        self.bindings.remove(thread_id).is_some()
    }

    /// Count of bindings whose runs are still open.
    pub fn open_count(&self) -> usize {
        self.bindings.iter().filter(|entry| entry.value().is_open()).count()
    }
}
