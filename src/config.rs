use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// JSON file listing discovered instances and their service endpoints.
    pub discovery_file: PathBuf,
    pub discovery_refresh_ms: u64,
    /// Interval between connection reconciliation passes.
    pub heartbeat_ms: u64,
    /// Delay between two ticks of the registry loop.
    pub poll_interval_ms: u64,
    /// Readiness poll timeout; zero keeps the poll non-blocking.
    pub poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// A broadcast service silent for longer than this is considered stale.
    pub stale_after_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Minimum delay before a failed program fetch is tried again.
    pub fetch_retry_ms: u64,
    /// Name of the program file the frontend uploads to the machine.
    pub remote_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_file: "instances.json".into(),
            discovery_refresh_ms: 1000,
            heartbeat_ms: 500,
            poll_interval_ms: 20,
            poll_timeout_ms: 0,
            connect_timeout_ms: 2000,
            stale_after_ms: 5000,
            fetch_timeout_ms: 5000,
            fetch_retry_ms: 2000,
            remote_filename: "mkbridge.ngc".into(),
            jobs_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("mkbridge.toml"))
            .merge(Json::file("mkbridge.json"))
            .merge(Env::prefixed("MKBRIDGE_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.heartbeat_ms == 0 {
            anyhow::bail!("heartbeat_ms must be greater than zero");
        }
        if config.remote_filename.trim().is_empty() {
            anyhow::bail!("remote_filename must not be empty");
        }

        Ok(config)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn fetch_retry(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_ms)
    }

    pub fn discovery_refresh(&self) -> Duration {
        Duration::from_millis(self.discovery_refresh_ms)
    }
}
