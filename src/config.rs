// Client configuration: defaults, JSON file, environment overrides

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_URL: &str = "wss://it342-g5-collaboraid.onrender.com/ws/websocket";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub send_destination: String,
    pub topic_prefix: String,
    pub accept_version: String,
    // Values advertised in the CONNECT heart-beat header
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    /// How often we send a keep-alive EOL while connected
    pub keepalive_interval_ms: u64,
    /// Drop the connection if the broker stays silent this long. Off when unset.
    pub server_silence_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub max_connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            send_destination: "/app/sendMessage".to_string(),
            topic_prefix: "/topic/messages/".to_string(),
            accept_version: "1.1,1.0".to_string(),
            heartbeat_outgoing_ms: 10_000,
            heartbeat_incoming_ms: 10_000,
            keepalive_interval_ms: 30_000,
            server_silence_timeout_ms: None,
            connect_timeout_ms: 15_000,
            max_connect_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            channel_capacity: 100,
        }
    }
}

impl ClientConfig {
    pub fn topic_for(&self, user_id: i64) -> String {
        format!("{}{}", self.topic_prefix, user_id)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn server_silence_timeout(&self) -> Option<Duration> {
        self.server_silence_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Load from `path`, or from the default location if it exists, then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = get_config_path()?;
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    debug!("No config file at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ClientConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("COLLABORAID_WS_URL") {
            debug!("Using WebSocket URL from environment: {}", url);
            self.url = url;
        }
        if let Ok(timeout) = std::env::var("COLLABORAID_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = timeout
                .parse()
                .map_err(|e| anyhow!("Invalid COLLABORAID_CONNECT_TIMEOUT_MS '{}': {}", timeout, e))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(anyhow!("WebSocket URL must start with ws:// or wss://: {}", self.url));
        }
        if self.max_connect_attempts == 0 {
            return Err(anyhow!("max_connect_attempts must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel_capacity must be at least 1"));
        }
        Ok(())
    }
}

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `dir` instead of the platform config directory. Only the first call wins.
pub fn set_config_dir_override(dir: PathBuf) {
    if CONFIG_DIR_OVERRIDE.set(dir).is_err() {
        debug!("Config directory override already set");
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.get() {
        return Ok(dir.clone());
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("collaboraid");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}
