use thiserror::Error;

/// Coarse failure taxonomy carried into quarantine and onto dead-letter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or empty id, empty or malformed payload. Never retried against storage.
    Structural,
    /// The storage gateway rejected or could not complete an upsert.
    Storage,
    /// A publish or dead-letter send failed.
    Transport,
    /// The quarantine retry ceiling was reached.
    Exhaustion,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Storage => "storage",
            ErrorKind::Transport => "transport",
            ErrorKind::Exhaustion => "exhaustion",
        }
    }
}

/// Errors reported by a `DeviceStore`. A failed upsert never leaves a partial write behind.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("storage operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

/// Errors returned by a `RecordSink` when producing to an output channel.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Produce(#[from] rdkafka::error::KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

/// A publish that could not even be attempted. Send failures are not errors, they are
/// logged and counted by the publish gateway.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize device record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural checks run by quarantine on every retry attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is {len} bytes, shorter than the {min} byte minimum")]
    TruncatedPayload { len: usize, min: usize },
    #[error("payload is not a well-formed record: {0}")]
    MalformedPayload(String),
    #[error("device id is missing")]
    MissingId,
    #[error("device id is longer than {max} bytes ({len})")]
    IdTooLong { len: usize, max: usize },
    #[error("device id contains characters outside [a-zA-Z0-9_-]")]
    InvalidIdCharset,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} is out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },
    #[error("unknown ack policy: {0}")]
    UnknownAckPolicy(String),
}
