//! Configuration for the server and the client.
//!
//! Loaded from a TOML file with `[server]` and `[client]` tables. Every field
//! has a default, so an absent file or table is valid.

use crate::error::{Error, Result};
use crate::protocol::{
    CHUNK_SIZE, DEFAULT_RESULT_LIMIT, MAX_AUDIO_DURATION_MS, MAX_FILE_SIZE, MAX_FRAME_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Room left in a frame for the non-binary fields of a chunk.
const CHUNK_FRAME_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Directory holding staged uploads and stored blobs
    pub storage_dir: PathBuf,
    pub max_file_size: u64,
    pub max_audio_duration_ms: u32,
    /// Buffer size for download streaming
    pub chunk_size: usize,
    /// HISTORY/SEARCH limit when a request leaves it at 0
    pub default_limit: u32,
    /// Frames buffered per connection before writers wait
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9040".to_string(),
            storage_dir: default_storage_dir(),
            max_file_size: MAX_FILE_SIZE,
            max_audio_duration_ms: MAX_AUDIO_DURATION_MS,
            chunk_size: CHUNK_SIZE,
            default_limit: DEFAULT_RESULT_LIMIT,
            outbound_queue: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub ack_timeout_ms: u64,
    /// Total attempts for one transfer, the first included
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub max_audio_duration_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            max_attempts: 3,
            retry_backoff_ms: 1_000,
            chunk_size: CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            max_audio_duration_ms: MAX_AUDIO_DURATION_MS,
        }
    }
}

impl ClientConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("courier"))
        .unwrap_or_else(|| PathBuf::from("courier-data"))
}

fn check_chunk_size(table: &str, chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size + CHUNK_FRAME_OVERHEAD > MAX_FRAME_SIZE as usize {
        return Err(Error::Config(format!(
            "{}.chunk_size must be between 1 and {}",
            table,
            MAX_FRAME_SIZE as usize - CHUNK_FRAME_OVERHEAD
        )));
    }
    Ok(())
}

impl Config {
    /// `<config dir>/courier/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("courier").join("config.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Load an explicit file, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_chunk_size("server", self.server.chunk_size)?;
        check_chunk_size("client", self.client.chunk_size)?;
        if self.client.max_attempts == 0 {
            return Err(Error::Config("client.max_attempts must be at least 1".into()));
        }
        if self.server.outbound_queue == 0 {
            return Err(Error::Config("server.outbound_queue must be at least 1".into()));
        }
        Ok(())
    }
}
