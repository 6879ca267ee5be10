use std::sync::Arc;

use tether_core::session::SessionBackend;

use crate::pending::PendingToolCalls;
use crate::sessions::SessionRegistry;
use crate::state::StateReconciler;
use crate::streams::ActiveStreams;

/// Every piece of cross-request state, owned by one server instance.
///
/// Tool handlers keep a `Weak` reference; if the owner is gone they answer
/// the model with a failure result instead of hanging.
pub struct RunRegistries {
    pub sessions: SessionRegistry,
    pub pending: PendingToolCalls,
    pub streams: ActiveStreams,
    pub state: StateReconciler,
}

impl RunRegistries {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            sessions: SessionRegistry::new(backend),
            pending: PendingToolCalls::new(),
            streams: ActiveStreams::new(),
            state: StateReconciler::new(),
        }
    }
}
