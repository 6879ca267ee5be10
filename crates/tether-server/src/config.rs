use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_engine::prompt::DEFAULT_SYSTEM_MESSAGE;

/// How long a model session lives relative to the runs that use it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionLifetime {
    /// Sessions outlive runs and are released only by thread deletion.
    #[default]
    Resumable,
    /// Sessions are aborted and released when a run's stream closes.
    PerRun,
}

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub system_message: String,
    pub session_lifetime: SessionLifetime,
    /// Evict pending tool calls older than this. Unset means never.
    pub pending_ttl_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    /// Install the state tools even when a run supplies no state snapshot.
    pub always_expose_state_tools: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            system_message: DEFAULT_SYSTEM_MESSAGE.into(),
            session_lifetime: SessionLifetime::Resumable,
            pending_ttl_secs: None,
            sweep_interval_secs: 60,
            always_expose_state_tools: false,
        }
    }
}

impl ServerConfig {
    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
