use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_engine::scripted::ScriptedBackend;
use tether_server::{ServerConfig, SessionLifetime};
use tether_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Serve the run orchestration protocol over HTTP/SSE.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
struct Args {
    #[arg(long, env = "TETHER_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "TETHER_PORT", default_value_t = 9091)]
    port: u16,

    /// Base system instruction given to every new session.
    #[arg(long, env = "TETHER_SYSTEM_MESSAGE")]
    system_message: Option<String>,

    /// Release sessions when each run's stream closes.
    #[arg(long, env = "TETHER_PER_RUN_SESSIONS")]
    per_run_sessions: bool,

    /// Evict tool calls left unresolved for this many seconds.
    #[arg(long, env = "TETHER_PENDING_TTL_SECS")]
    pending_ttl_secs: Option<u64>,

    #[arg(long, env = "TETHER_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Install the state tools even without a client state snapshot.
    #[arg(long, env = "TETHER_STATE_TOOLS")]
    always_expose_state_tools: bool,

    #[arg(long, env = "TETHER_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// `json` or `pretty`.
    #[arg(long, env = "TETHER_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            system_message: self.system_message.clone().unwrap_or(defaults.system_message),
            session_lifetime: if self.per_run_sessions {
                SessionLifetime::PerRun
            } else {
                SessionLifetime::Resumable
            },
            pending_ttl_secs: self.pending_ttl_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            always_expose_state_tools: self.always_expose_state_tools,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        module_levels: Vec::new(),
        format: args.log_format,
    })
    .context("failed to initialise logging")?;

    tracing::info!("starting tether with the scripted echo backend");

    let handle = tether_server::start(args.server_config(), Arc::new(ScriptedBackend::echo()))
        .await
        .context("failed to start server")?;
    tracing::info!(url = %handle.base_url(), "tether ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
