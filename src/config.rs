// src/config.rs

//! Manages configuration: loading from TOML, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use tracing::warn;
use uuid::Uuid;

/// Client-side connection settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Negative means requests expect no response.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: i64,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,
    /// Credentials for the account handshake. An empty username skips it.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            persistent: false,
            file_chunk_size: default_file_chunk_size(),
            username: String::new(),
            password: String::new(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_receive_timeout_ms() -> i64 {
    5_000
}
fn default_file_chunk_size() -> usize {
    102_400
}

/// Which login pipeline the server runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Token-checked envelopes, optional account login, echo handler.
    #[default]
    Hsl,
    /// DTU registration packets, raw data afterwards.
    Alien,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub mode: ServerMode,
    /// Envelope token peers must present. Defaults to the nil UUID.
    #[serde(default)]
    pub token: Uuid,
    /// Sessions silent for longer than this are closed. `0` disables the sweep.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Username to password. Empty disables the account check.
    #[serde(default)]
    pub accounts: HashMap<String, String>,
    /// Initial delay after a failed accept; doubles up to a cap.
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::default(),
            token: Uuid::nil(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            accounts: HashMap::new(),
            accept_backoff_ms: default_accept_backoff_ms(),
        }
    }
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}
fn default_accept_backoff_ms() -> u64 {
    100
}

/// DTU registration policy.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AlienConfig {
    /// Six ASCII characters; empty disables the password check.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub forbidden: Vec<String>,
}

/// The validated configuration.
#[derive(Serialize, Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// `0` means unlimited.
    pub max_sessions: usize,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub alien: AlienConfig,
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_sessions")]
    max_sessions: usize,
    #[serde(default)]
    client: ClientConfig,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    alien: AlienConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_sessions() -> usize {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_sessions: default_max_sessions(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            alien: AlienConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            max_sessions: raw_config.max_sessions,
            client: raw_config.client,
            server: raw_config.server,
            alien: raw_config.alien,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.client.connect_timeout_ms == 0 {
            return Err(anyhow!("client.connect_timeout_ms cannot be 0"));
        }
        if self.client.file_chunk_size == 0 {
            return Err(anyhow!("client.file_chunk_size cannot be 0"));
        }
        if !self.client.username.is_empty() && self.server.token.is_nil() {
            warn!("client.username is set but server.token is nil; any peer can read the login.");
        }

        if !self.alien.password.is_empty()
            && (self.alien.password.len() != 6 || !self.alien.password.is_ascii())
        {
            return Err(anyhow!("alien.password must be exactly 6 ASCII characters"));
        }
        for device in &self.alien.forbidden {
            if device.is_empty() || device.len() > 11 || !device.is_ascii() {
                return Err(anyhow!(
                    "alien.forbidden entry '{device}' must be 1 to 11 ASCII characters"
                ));
            }
        }

        if self.server.mode == ServerMode::Alien && !self.server.accounts.is_empty() {
            warn!("server.accounts is ignored in alien mode.");
        }
        if self.server.heartbeat_timeout_secs == 0 {
            warn!("server.heartbeat_timeout_secs is 0; idle sessions are never closed.");
        }

        Ok(())
    }
}
