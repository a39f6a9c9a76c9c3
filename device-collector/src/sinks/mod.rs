use async_trait::async_trait;

use crate::error::SinkError;

pub mod kafka;
pub mod print;

pub use kafka::KafkaSink;
pub use print::PrintSink;

/// Keyed, already-serialized output. Implementations resolve once the write was
/// delivered or definitively failed.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), SinkError>;
}
