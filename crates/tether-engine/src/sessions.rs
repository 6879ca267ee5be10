//! Thread → model session cache.

use std::sync::Arc;

use dashmap::DashMap;
use tether_core::ids::ThreadId;
use tether_core::session::{ModelSession, SessionBackend, SessionConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Holds at most one live session per thread. Sessions outlive the runs that
/// use them and are only dropped by [`SessionRegistry::remove`] or
/// [`SessionRegistry::release`].
pub struct SessionRegistry {
    backend: Arc<dyn SessionBackend>,
    sessions: DashMap<ThreadId, Arc<dyn ModelSession>>,
    /// Per-thread creation locks so two runs cannot both create a session
    /// for one thread, while other threads proceed independently.
    creating: DashMap<ThreadId, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            sessions: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    pub fn get(&self, thread_id: &ThreadId) -> Option<Arc<dyn ModelSession>> {
        self.sessions.get(thread_id).map(|s| Arc::clone(s.value()))
    }

    /// Return the thread's cached session, or resume the backend session
    /// whose id equals the thread id, or create a fresh one. `config` is only
    /// called when the cache misses.
    pub async fn get_or_create(
        &self,
        thread_id: &ThreadId,
        config: impl FnOnce() -> SessionConfig,
    ) -> Result<Arc<dyn ModelSession>, EngineError> {
        if let Some(session) = self.get(thread_id) {
            return Ok(session);
        }

        let lock = Arc::clone(self.creating.entry(thread_id.clone()).or_default().value());
        let _guard = lock.lock().await;
        if let Some(session) = self.get(thread_id) {
            return Ok(session);
        }

        let config = config();
        let known = self
            .backend
            .list_sessions()
            .await?
            .into_iter()
            .any(|meta| meta.session_id == thread_id.as_str());

        let session = if known {
            info!(thread_id = %thread_id, "resuming existing model session");
            self.backend.resume_session(thread_id.as_str(), config).await?
        } else {
            info!(thread_id = %thread_id, tools = config.tools.len(), "creating model session");
            self.backend.create_session(config).await?
        };

        self.sessions.insert(thread_id.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Drop and destroy the thread's session. Returns false if none was cached.
    pub async fn remove(&self, thread_id: &ThreadId) -> Result<bool, EngineError> {
        self.creating.remove(thread_id);
        let Some((_, session)) = self.sessions.remove(thread_id) else {
            return Ok(false);
        };
        session.destroy().await?;
        info!(thread_id = %thread_id, "model session destroyed");
        Ok(true)
    }

    /// Drop the thread's session and abort its turn, keeping it resumable on
    /// the backend side.
    pub async fn release(&self, thread_id: &ThreadId) {
        if let Some((_, session)) = self.sessions.remove(thread_id) {
            if let Err(e) = session.abort().await {
                warn!(thread_id = %thread_id, error = %e, "abort on release failed");
            }
            debug!(thread_id = %thread_id, "model session released");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
