use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SyncError;

// =============================================================================
// File config (figment-deserialized from defaults / market-sync.toml / env vars)
// =============================================================================
//
//   market-sync.toml:   [reconnect]
//                       max_attempts = 5
//
//   env var:            MARKET_SYNC_RECONNECT__MAX_ATTEMPTS=5   (double underscore = nesting)

pub const CONFIG_FILE_NAME: &str = "market-sync.toml";
pub const ENV_PREFIX: &str = "MARKET_SYNC_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
}

/// Endpoints (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
        }
    }
}

/// Reconnect backoff (lives under `[reconnect]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    /// Capacity of the outbound and inbound transport queues.
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:4000/live".to_string()
}
fn default_api_url() -> String {
    "http://127.0.0.1:4000/api".to_string()
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_channel_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → market-sync.toml → MARKET_SYNC_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

/// Backoff schedule for reconnecting after an unexpected drop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_file(&ReconnectFileConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_file(fc: &ReconnectFileConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(fc.initial_delay_ms),
            max_delay: Duration::from_millis(fc.max_delay_ms),
            max_attempts: fc.max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubles from
    /// `initial_delay`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Resolved configuration for one session.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub ws_url: String,
    pub api_url: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            ws_url: fc.server.ws_url.clone(),
            api_url: fc.server.api_url.trim_end_matches('/').to_string(),
            reconnect: ReconnectPolicy::from_file(&fc.reconnect),
            heartbeat_interval: Duration::from_secs(fc.heartbeat.interval_secs.max(1)),
            channel_capacity: fc.channel.capacity.max(1),
        }
    }

    /// Resolve the layered config found in `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Self, SyncError> {
        let fc: FileConfig = load_config(config_dir).extract()?;
        Ok(Self::from_file(&fc))
    }
}
