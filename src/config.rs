//! Process configuration

use crate::core::Core;
use crate::lifecycle::LifecycleSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the panel
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Panel data, binaries, and lifecycle timing
    #[serde(default)]
    pub panel: PanelConfig,

    /// Timer-driven reset scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 8787)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PanelConfig {
    /// Root for per-core config directories, logs, and the database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory holding the core server binaries, tried before PATH fallback
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,

    /// Cores to build lifecycle managers for at startup
    #[serde(default = "default_cores")]
    pub cores: Vec<Core>,

    /// Node agent request timeout in seconds (default: 10)
    #[serde(default = "default_agent_timeout")]
    pub node_agent_timeout_secs: u64,

    /// Override the pause after spawn before the liveness re-check
    pub startup_settle_ms: Option<u64>,

    /// Override the grace period between SIGTERM and SIGKILL
    pub shutdown_grace_secs: Option<u64>,

    /// Override the reachability probe connect timeout
    pub probe_timeout_ms: Option<u64>,
}

impl PanelConfig {
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        let defaults = LifecycleSettings::default();
        LifecycleSettings {
            startup_settle: self
                .startup_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.startup_settle),
            shutdown_grace: self
                .shutdown_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            probe_timeout: self
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Run the reset scheduler loop (default: true)
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Seconds between schedule checks (default: 30)
    #[serde(default = "default_scheduler_tick")]
    pub tick_secs: u64,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            panel: PanelConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bin_dir: default_bin_dir(),
            cores: default_cores(),
            node_agent_timeout_secs: default_agent_timeout(),
            startup_settle_ms: None,
            shutdown_grace_secs: None,
            probe_timeout_ms: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_secs: default_scheduler_tick(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8787
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("/usr/local/bin")
}

fn default_cores() -> Vec<Core> {
    Core::ALL.to_vec()
}

fn default_agent_timeout() -> u64 {
    10
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_tick() -> u64 {
    30
}
