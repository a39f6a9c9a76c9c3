use async_trait::async_trait;
use tracing::info;

use crate::error::SinkError;
use crate::sinks::RecordSink;

pub struct PrintSink {}

#[async_trait]
impl RecordSink for PrintSink {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        info!(
            topic,
            key,
            payload = %String::from_utf8_lossy(&payload),
            "print sink"
        );
        Ok(())
    }
}
