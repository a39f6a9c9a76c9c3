use std::sync::Arc;

use tracing::{debug, warn};

use crate::dedup::DedupCache;
use crate::error::PublishError;
use crate::metrics::{Counter, PipelineMetrics};
use crate::sinks::RecordSink;
use crate::types::DeviceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Already published within the dedup window, nothing was sent.
    Skipped,
    /// Claimed but the send failed. The claim stays until it expires.
    SendFailed,
}

/// Publishes each device id at most once per dedup window to the canonical output topic.
#[derive(Clone)]
pub struct PublishGateway {
    cache: DedupCache,
    sink: Arc<dyn RecordSink>,
    topic: String,
    metrics: Arc<dyn PipelineMetrics>,
}

impl PublishGateway {
    pub fn new(
        cache: DedupCache,
        sink: Arc<dyn RecordSink>,
        topic: impl Into<String>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self {
            cache,
            sink,
            topic: topic.into(),
            metrics,
        }
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    /// Sends `record` keyed by its id unless the id was already claimed.
    ///
    /// The record is serialized before claiming, so a record that cannot be encoded never
    /// takes a slot in the cache. Send failures are logged and counted, but the claim is
    /// not rolled back: that id will not be published again until its entry expires.
    pub async fn publish_if_new(&self, record: &DeviceRecord) -> Result<PublishOutcome, PublishError> {
        let payload = serde_json::to_vec(record)?;

        if !self.cache.try_claim(&record.id) {
            debug!(device_id = %record.id, "already published, skipping");
            self.metrics.increment(Counter::PublishSkipped, 1);
            return Ok(PublishOutcome::Skipped);
        }

        match self.sink.send(&self.topic, &record.id, payload).await {
            Ok(()) => {
                self.metrics.increment(Counter::PublishSent, 1);
                Ok(PublishOutcome::Sent)
            }
            Err(e) => {
                warn!(
                    device_id = %record.id,
                    topic = %self.topic,
                    error_kind = e.kind().as_str(),
                    "failed to publish device: {}",
                    e
                );
                self.metrics.increment(Counter::PublishFailed, 1);
                Ok(PublishOutcome::SendFailed)
            }
        }
    }
}
