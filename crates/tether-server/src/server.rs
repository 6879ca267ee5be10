use std::sync::Arc;

use tether_core::session::SessionBackend;
use tether_engine::RunRegistries;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::http::{self, AppState};
use crate::orchestrator::RunOrchestrator;

/// Handle returned by `start()`. Dropping it does not stop the server;
/// call [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    pub orchestrator: Arc<RunOrchestrator>,
    server: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn shutdown(self) {
        self.server.abort();
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
    }
}

/// Bind the listener, spawn the HTTP server and, when a pending TTL is
/// configured, the pending tool-call sweeper.
pub async fn start(
    config: ServerConfig,
    backend: Arc<dyn SessionBackend>,
) -> Result<ServerHandle, std::io::Error> {
    let registries = Arc::new(RunRegistries::new(backend));
    let orchestrator = Arc::new(RunOrchestrator::new(registries, config.clone()));

    let router = http::router(AppState {
        orchestrator: Arc::clone(&orchestrator),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, lifetime = ?config.session_lifetime, "tether server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "server stopped");
        }
    });

    let sweeper = config
        .pending_ttl()
        .map(|ttl| spawn_sweeper(Arc::clone(&orchestrator), ttl, config.sweep_interval()));

    Ok(ServerHandle {
        port: local_addr.port(),
        orchestrator,
        server,
        sweeper,
    })
}

fn spawn_sweeper(
    orchestrator: Arc<RunOrchestrator>,
    ttl: std::time::Duration,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let evicted = orchestrator.sweep_pending(ttl);
            if evicted.is_empty() {
                debug!("no stale pending tool calls");
            } else {
                info!(count = evicted.len(), "evicted stale pending tool calls");
            }
        }
    })
}
