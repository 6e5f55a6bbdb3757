use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the relay components.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Broker connection is not available.")]
    NotConnected,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Subscription {0} not found.")]
    NotFound(Uuid),
    #[error("Malformed broker payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Broker error: {0}")]
    Broker(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Stored value could not be decoded: {0}")]
    Encoding(String),
}

/// Errors a delivery sink reports back to the fan-out registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer behind the sink is gone; the subscription is removed.
    #[error("Sink is closed.")]
    Closed,
    #[error("Delivery failed: {0}")]
    Failed(String),
}
