//! Configuration: TOML file layered with environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "agentdeck";

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub replay: ReplayConfig,
    pub capture: CaptureConfig,
    pub paths: PathsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            replay: ReplayConfig::default(),
            capture: CaptureConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the agent gateway.
    pub url: String,
    /// Deadline for a single outbound call.
    pub request_timeout_secs: u64,
    /// Deadline for the challenge/response handshake.
    pub auth_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9800/ws".to_string(),
            request_timeout_secs: 30,
            auth_timeout_secs: 10,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Byte ceiling per stream buffer.
    pub byte_ceiling: usize,
    /// Idle window after which an open buffer is evicted.
    pub idle_evict_secs: u64,
    /// Grace period a closed stream stays replayable.
    pub close_grace_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            byte_ceiling: crate::replay::DEFAULT_BYTE_CEILING,
            idle_evict_secs: 1800,
            close_grace_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Poll interval for the tmux adapter.
    pub interval_ms: u64,
    /// Initial capture target (tmux session name).
    pub target: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            target: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathsConfig {
    /// Override for the state directory (device key lives here).
    pub state_dir: Option<String>,
}

impl AppConfig {
    /// Load from the given (or default) config file, then apply
    /// `AGENTDECK_`-prefixed environment overrides. A missing file
    /// yields the defaults.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let path = match config_file {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };

        let settings = Config::builder()
            .add_source(File::from(path.as_path()).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("AGENTDECK").separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Where the device keypair is persisted.
    pub fn device_key_path(&self) -> Result<PathBuf> {
        let state_dir = match self.paths.state_dir {
            Some(ref dir) => PathBuf::from(dir),
            None => default_state_dir()?,
        };
        Ok(state_dir.join("device.key"))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().ok_or_else(|| anyhow!("cannot determine config directory"))?;
    Ok(dir.join(APP_NAME).join("config.toml"))
}

pub fn default_state_dir() -> Result<PathBuf> {
    let dir = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .ok_or_else(|| anyhow!("cannot determine state directory"))?;
    Ok(dir.join(APP_NAME))
}
