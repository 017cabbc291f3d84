//! Shared configuration for roomdrop tools
//!
//! Reads from ~/.roomdrop/config.toml

use anyhow::{Context, Result};
use roomdrop_core::Tier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest session lifetime accepted from config: one year
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_ttl_anonymous")]
    pub session_ttl_anonymous_secs: u64,
    #[serde(default = "default_ttl_authenticated")]
    pub session_ttl_authenticated_secs: u64,
    #[serde(default = "default_ttl_premium")]
    pub session_ttl_premium_secs: u64,
    /// Rooms an anonymous fingerprint may create per UTC day
    #[serde(default = "default_anonymous_daily_rooms")]
    pub anonymous_daily_rooms: u32,
    /// Outbound event queue depth per connection
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            session_ttl_anonymous_secs: default_ttl_anonymous(),
            session_ttl_authenticated_secs: default_ttl_authenticated(),
            session_ttl_premium_secs: default_ttl_premium(),
            anonymous_daily_rooms: default_anonymous_daily_rooms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl RelayConfig {
    /// How long a session created by a client of `tier` lives, capped at
    /// [`MAX_SESSION_TTL_SECS`]
    pub fn session_ttl(&self, tier: Tier) -> Duration {
        let secs = match tier {
            Tier::Anonymous => self.session_ttl_anonymous_secs,
            Tier::Authenticated => self.session_ttl_authenticated_secs,
            Tier::Premium => self.session_ttl_premium_secs,
        };
        Duration::from_secs(secs.min(MAX_SESSION_TTL_SECS))
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_ttl_anonymous() -> u64 {
    60 * 60
}

fn default_ttl_authenticated() -> u64 {
    24 * 60 * 60
}

fn default_ttl_premium() -> u64 {
    7 * 24 * 60 * 60
}

fn default_anonymous_daily_rooms() -> u32 {
    5
}

fn default_event_buffer() -> usize {
    64
}

/// File transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Payload bytes per binary frame
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_anonymous_rate")]
    pub anonymous_bytes_per_sec: u64,
    #[serde(default = "default_authenticated_rate")]
    pub authenticated_bytes_per_sec: u64,
    #[serde(default = "default_speed_update_interval_ms")]
    pub speed_update_interval_ms: u64,
    /// Pause between two files of a batch
    #[serde(default = "default_inter_file_delay_ms")]
    pub inter_file_delay_ms: u64,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            anonymous_bytes_per_sec: default_anonymous_rate(),
            authenticated_bytes_per_sec: default_authenticated_rate(),
            speed_update_interval_ms: default_speed_update_interval_ms(),
            inter_file_delay_ms: default_inter_file_delay_ms(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl TransferConfig {
    /// Byte-per-second ceiling for `tier`, `None` when unthrottled
    pub fn rate_limit(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Anonymous => Some(self.anonymous_bytes_per_sec),
            Tier::Authenticated => Some(self.authenticated_bytes_per_sec),
            Tier::Premium => None,
        }
    }

    pub fn speed_update_interval(&self) -> Duration {
        Duration::from_millis(self.speed_update_interval_ms)
    }

    pub fn inter_file_delay(&self) -> Duration {
        Duration::from_millis(self.inter_file_delay_ms)
    }
}

fn default_chunk_size() -> usize {
    32 * 1024
}

fn default_anonymous_rate() -> u64 {
    30 * 1024
}

fn default_authenticated_rate() -> u64 {
    1024 * 1024
}

fn default_speed_update_interval_ms() -> u64 {
    50
}

fn default_inter_file_delay_ms() -> u64 {
    500
}

fn default_max_file_size() -> u64 {
    500 * 1024 * 1024
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from an explicit path, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the roomdrop directory (~/.roomdrop)
pub fn get_roomdrop_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ROOMDROP_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".roomdrop")
}

/// Get the config file path (~/.roomdrop/config.toml)
pub fn get_config_path() -> PathBuf {
    get_roomdrop_dir().join("config.toml")
}
