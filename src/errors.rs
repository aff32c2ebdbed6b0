//! Errors for AIS tracker
use thiserror::Error;

/// Startup and configuration failures. These are the only errors that end
/// the process.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Database connection error: {0}")]
    DatabaseConnectionError(String),

    #[error("Database migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
}

/// Upstream transport failures. Never fatal, they drive a reconnect.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Connection closed by upstream")]
    Closed,

    #[error("Subscription encoding failed")]
    SerdeError(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// A single inbound frame could not be turned into a position update.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected message type: {0}")]
    UnknownMessageType(String),

    #[error("Frame has no position report")]
    MissingPositionReport,

    #[error("Invalid MMSI: {0}")]
    InvalidMmsi(String),

    #[error("Position out of range: lat={lat}, lon={lon}")]
    PositionOutOfRange { lat: f64, lon: f64 },
}

/// Vessel store failures, both on the write and the read path.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Store operation timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

/// Errors surfaced by the query API.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Vessel store query failed")]
    Store(#[from] StoreError),
}
