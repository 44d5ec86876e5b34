//! Configuration system for Ridge.
//!
//! Resolution order: command line → environment variables → config file → defaults.
//! The command line layer lives in each binary; this module covers the rest.
//!
//! Config file location:
//!   1. $RIDGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ridge/config.toml
//!   3. ~/.config/ridge/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_PAYLOAD;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address the server binds.
    pub bind: SocketAddr,
    /// Flat `name size` catalog file.
    pub catalog_path: PathBuf,
    /// Directory the catalog names are resolved against.
    pub files_dir: PathBuf,
    /// Idle sessions without live transfers are dropped after this many seconds.
    pub session_idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address.
    pub server: SocketAddr,
    /// Upper bound on parallel parts per file. Capped at `MAX_PARTS`.
    pub max_parts: usize,
    /// File listing the names to download, one per line.
    pub input_file: PathBuf,
    /// Where downloaded files land.
    pub output_dir: PathBuf,
    /// Seconds between input file scans.
    pub scan_interval_secs: u64,
}

/// Reliability knobs shared by both peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per DATA packet.
    pub chunk_size: usize,
    /// How long the sender waits for each acknowledgment.
    pub ack_timeout_ms: u64,
    /// Resends allowed per packet before the transfer fails.
    pub max_retries: u32,
    /// How long the receiver waits for the next datagram.
    pub receive_timeout_ms: u64,
    /// Consecutive receive timeouts before the receiver gives up.
    pub max_receive_timeouts: u32,
    /// Finished transfers and their cached chunks are kept this long.
    pub eviction_grace_secs: u64,
    /// The receiver keeps answering duplicate END/DATA this long after finishing.
    pub end_linger_ms: u64,
}

/// Hard cap on parts per file, whatever the configuration says.
pub const MAX_PARTS: usize = 4;

/// Largest allowed `chunk_size`.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD;

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            catalog_path: PathBuf::from("file_list.txt"),
            files_dir: PathBuf::from("server_files"),
            session_idle_secs: 300,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_parts: MAX_PARTS,
            input_file: PathBuf::from("input.txt"),
            output_dir: PathBuf::from("downloads"),
            scan_interval_secs: 5,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            ack_timeout_ms: 500,
            max_retries: 8,
            receive_timeout_ms: 2_000,
            max_receive_timeouts: 5,
            eviction_grace_secs: 5,
            end_linger_ms: 1_000,
        }
    }
}

impl TransferConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }

    pub fn end_linger(&self) -> Duration {
        Duration::from_millis(self.end_linger_ms)
    }
}

impl ServerConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

impl ClientConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ridge")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RidgeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Same as `load`, reading an explicit file instead of the default path.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            RidgeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse one config file, without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RidgeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings no transfer can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.chunk_size == 0 || t.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(
                "transfer.chunk_size",
                format!("{} not in 1..={}", t.chunk_size, MAX_CHUNK_SIZE),
            ));
        }
        if t.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transfer.ack_timeout_ms", "must be > 0".into()));
        }
        if t.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transfer.receive_timeout_ms", "must be > 0".into()));
        }
        Ok(())
    }

    /// Apply RIDGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RIDGE_SERVER__BIND").and_then(|v| v.parse().ok()) {
            self.server.bind = v;
        }
        if let Some(v) = lookup("RIDGE_SERVER__CATALOG_PATH") {
            self.server.catalog_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RIDGE_SERVER__FILES_DIR") {
            self.server.files_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RIDGE_CLIENT__SERVER").and_then(|v| v.parse().ok()) {
            self.client.server = v;
        }
        if let Some(v) = lookup("RIDGE_CLIENT__MAX_PARTS").and_then(|v| v.parse().ok()) {
            self.client.max_parts = v;
        }
        if let Some(v) = lookup("RIDGE_CLIENT__INPUT_FILE") {
            self.client.input_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("RIDGE_CLIENT__OUTPUT_DIR") {
            self.client.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RIDGE_TRANSFER__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.transfer.chunk_size = v;
        }
        if let Some(v) = lookup("RIDGE_TRANSFER__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transfer.ack_timeout_ms = v;
        }
        if let Some(v) = lookup("RIDGE_TRANSFER__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.transfer.max_retries = v;
        }
    }
}
