/// Error types shared across the ingestion, storage and query paths
use thiserror::Error;

/// Reasons a reading is rejected at ingestion. The display string is the
/// reason reported back to the submitting client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid device key: {0:?}")]
    InvalidDeviceKey(String),
    #[error("temperature out of range: {0}")]
    TemperatureOutOfRange(f64),
    #[error("humidity out of range: {0}")]
    HumidityOutOfRange(f64),
    #[error("battery out of range: {0}")]
    BatteryOutOfRange(f64),
    #[error("timestamp too old: {0}")]
    StaleTimestamp(String),
    #[error("timestamp in the future: {0}")]
    FutureTimestamp(String),
    #[error("{field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid sensor payload: {0}")]
    InvalidPayload(String),
}

/// Failures of the durable store. Load paths mostly log and skip instead of
/// returning these; save paths always surface them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid device key: {0:?}")]
    InvalidDeviceKey(String),
    #[error("invalid partition key: {0:?}")]
    InvalidPartition(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Task(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid time bound {0:?}: expected RFC 3339")]
    InvalidTimeBound(String),
    #[error("invalid time range: from is after to")]
    ReversedRange,
    #[error("invalid device key: {0:?}")]
    InvalidDeviceKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing API key")]
    MissingKey,
    #[error("unknown API key")]
    UnknownKey,
    #[error("API key is not allowed to report for client {0:?}")]
    ClientMismatch(String),
    #[error("admin API key required")]
    AdminRequired,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("rejected: {0}")]
    Rejected(#[from] ValidationError),
}
