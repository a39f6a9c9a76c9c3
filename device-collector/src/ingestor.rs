use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::AckPolicy;
use crate::metrics::{Counter, PipelineMetrics};
use crate::publisher::PublishGateway;
use crate::quarantine::{PoisonItem, PoisonQuarantine, QuarantineOutcome};
use crate::storage::DeviceStore;
use crate::types::{DeviceRecord, InboundRecord};
use crate::validation::{classify, Classification, PoisonReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Commit the whole batch.
    Acknowledge,
    /// Leave the batch uncommitted.
    Withhold,
    /// Nothing was delivered, there is nothing to commit.
    Empty,
}

impl AckDecision {
    pub fn is_ack(&self) -> bool {
        matches!(self, AckDecision::Acknowledge)
    }
}

/// Drives one delivered batch through validation, storage, publishing and quarantine.
pub struct BatchIngestor {
    store: Arc<dyn DeviceStore>,
    publisher: PublishGateway,
    quarantine: PoisonQuarantine,
    ack_policy: AckPolicy,
    metrics: Arc<dyn PipelineMetrics>,
}

impl BatchIngestor {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        publisher: PublishGateway,
        quarantine: PoisonQuarantine,
        ack_policy: AckPolicy,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            quarantine,
            ack_policy,
            metrics,
        }
    }

    pub fn quarantine(&self) -> &PoisonQuarantine {
        &self.quarantine
    }

    pub fn dedup_entries(&self) -> u64 {
        self.publisher.cache().entry_count()
    }

    /// Records are handled one after the other. Per-record failures never escape: they turn
    /// the record into poison, and all poison of the batch is handed to quarantine in one go
    /// once the valid records are done.
    #[instrument(skip_all, fields(batch_size = records.len()))]
    pub async fn on_batch(&self, records: Vec<InboundRecord>) -> AckDecision {
        if records.is_empty() {
            return AckDecision::Empty;
        }

        let started = Instant::now();
        let batch_size = records.len();
        self.metrics.increment(Counter::BatchesReceived, 1);

        let mut processed = 0usize;
        let mut poison = Vec::new();

        for inbound in records {
            match classify(&inbound) {
                Classification::Valid(record) => match self.process(record).await {
                    Ok(()) => processed += 1,
                    Err(reason) => {
                        self.metrics.increment(Counter::RecordsReclassified, 1);
                        poison.push(PoisonItem::new(inbound, reason));
                    }
                },
                Classification::Poison(reason) => {
                    debug!(
                        partition = inbound.origin.partition,
                        offset = inbound.origin.offset,
                        "poison message: {}",
                        reason
                    );
                    poison.push(PoisonItem::new(inbound, reason));
                }
            }
        }

        self.metrics
            .increment(Counter::RecordsProcessed, processed as u64);

        let poisoned = poison.len();
        let handles = if poison.is_empty() {
            Vec::new()
        } else {
            self.quarantine.submit(poison)
        };

        let decision = match (processed, self.ack_policy) {
            (0, _) => AckDecision::Withhold,
            (_, AckPolicy::AnySuccess) => AckDecision::Acknowledge,
            (_, AckPolicy::AfterQuarantine) => {
                if all_durable(handles).await {
                    AckDecision::Acknowledge
                } else {
                    AckDecision::Withhold
                }
            }
        };

        match decision {
            AckDecision::Acknowledge => self.metrics.increment(Counter::BatchesAcked, 1),
            _ => self.metrics.increment(Counter::BatchesWithheld, 1),
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_batch(batch_size, elapsed_ms);
        info!(
            processed,
            poisoned,
            ack = decision.is_ack(),
            elapsed_ms,
            "batch handled"
        );

        decision
    }

    async fn process(&self, mut record: DeviceRecord) -> Result<(), PoisonReason> {
        record.stamp_meta(Utc::now());

        if let Err(e) = self.store.upsert(&record).await {
            warn!(device_id = %record.id, error_kind = e.kind().as_str(), "upsert failed: {}", e);
            self.metrics.increment(Counter::StorageFailures, 1);
            return Err(PoisonReason::Storage(e.to_string()));
        }

        self.publisher
            .publish_if_new(&record)
            .await
            .map_err(|e| PoisonReason::Unencodable(e.to_string()))?;

        Ok(())
    }
}

async fn all_durable(handles: Vec<JoinHandle<QuarantineOutcome>>) -> bool {
    join_all(handles).await.into_iter().all(|result| match result {
        Ok(outcome) => outcome.is_durable(),
        Err(e) => {
            warn!("quarantine task failed: {}", e);
            false
        }
    })
}
