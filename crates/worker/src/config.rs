use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the HTTP API binds to. Must be loopback.
    pub bind_address: IpAddr,
    /// TCP port assigned by the launching UI
    pub port: u16,
    /// Name of the UI process the instance watcher looks for
    pub ui_process_name: String,
    /// Interval between instance watcher checks
    pub watch_interval_ms: u64,
    /// Path to the HandBrakeCLI binary
    pub engine_bin: PathBuf,
    /// Upper bound on a single preview render
    pub preview_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl WorkerConfig {
    pub fn default_config() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8037,
            ui_process_name: "HandBrake".to_string(),
            watch_interval_ms: 5000,
            engine_bin: PathBuf::from("HandBrakeCLI"),
            preview_timeout_secs: 30,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Socket address for the HTTP API. Rejects anything off the loopback interface.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if !self.bind_address.is_loopback() {
            bail!(
                "Refusing to bind the worker API to {}: only loopback addresses are allowed",
                self.bind_address
            );
        }
        Ok(SocketAddr::new(self.bind_address, self.port))
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn preview_timeout(&self) -> Duration {
        Duration::from_secs(self.preview_timeout_secs)
    }
}
