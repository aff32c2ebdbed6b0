//! Application configuration

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::AppError;

pub const ENV_PREFIX: &str = "AISTRACKER";

/// Special database URL selecting the in-process store
pub const MEMORY_DATABASE_URL: &str = "memory";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Upstream aisstream.io connection
#[serde_as]
#[derive(Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_stream_url")]
    pub url: String,
    pub api_key: String,
    /// `[[[lat_min, lon_min], [lat_max, lon_max]], ...]`, whole world if empty
    #[serde(default)]
    pub bounding_boxes: Vec<[[f64; 2]; 2]>,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[serde_as]
#[derive(Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Failed flushes an update survives before it is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pending updates that trigger a flush ahead of the timer, 0 disables
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_store_timeout")]
    pub store_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_reaper_interval")]
    pub interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_store_timeout")]
    pub store_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_stream_url() -> String {
    "wss://stream.aisstream.io/v0/stream".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_connections() -> u32 {
    20
}

fn default_statement_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retries() -> u32 {
    3
}

fn default_high_water() -> usize {
    1_000
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            max_retries: default_max_retries(),
            high_water: default_high_water(),
            store_timeout: default_store_timeout(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: default_reaper_interval(),
            store_timeout: default_store_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("url", &self.url)
            .field("api_key", &"********")
            .field("bounding_boxes", &self.bounding_boxes)
            .field("connect_timeout", &self.connect_timeout)
            .field("backoff_initial_ms", &self.backoff_initial_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .finish()
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let url = match self.url.split_once('@') {
            Some((_, host)) => format!("postgres://********@{}", host),
            None => self.url.clone(),
        };
        f.debug_struct("DatabaseConfig")
            .field("url", &url)
            .field("max_connections", &self.max_connections)
            .field("statement_timeout", &self.statement_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/default")
    }

    /// Load `file` (any format the `config` crate knows, optional) overlaid
    /// with `AISTRACKER__SECTION__KEY` environment variables.
    pub fn load_from(file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(file.as_ref()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.stream.validate()?;
        self.database.validate()?;
        self.writer.validate()?;
        self.reaper.validate()?;
        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::ConfigurationError {
        message: message.to_string(),
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.api_key.trim().is_empty() {
            return Err(invalid("Stream API key cannot be empty"));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(invalid("Stream URL must use ws:// or wss://"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("Connect timeout must be greater than zero"));
        }
        if self.backoff_initial_ms == 0 || self.backoff_max_ms < self.backoff_initial_ms {
            return Err(invalid(
                "Backoff must start above zero and not exceed its maximum",
            ));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), AppError> {
        if self.url.trim().is_empty() {
            return Err(invalid("Database URL cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(invalid("Database pool needs at least one connection"));
        }
        Ok(())
    }

    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_DATABASE_URL
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.flush_interval.is_zero() {
            return Err(invalid("Flush interval must be greater than zero"));
        }
        if self.store_timeout.is_zero() {
            return Err(invalid("Store timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl ReaperConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.interval.is_zero() {
            return Err(invalid("Reaper interval must be greater than zero"));
        }
        Ok(())
    }
}
