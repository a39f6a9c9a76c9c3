//! Poison message quarantine.
//!
//! Every poison item gets its own task: it is re-validated up to the policy's attempt
//! ceiling with exponential backoff in between, and either recovers (dropped silently) or
//! is written once to the dead-letter topic. Quarantine never resurrects a record into the
//! storage path, and a failed dead-letter write is counted but never propagated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ErrorKind, StructuralError};
use crate::metrics::{Counter, PipelineMetrics};
use crate::retry::RetryPolicy;
use crate::sinks::RecordSink;
use crate::types::{InboundRecord, Origin, QuarantinedRecord, SOURCE_SERVICE};
use crate::validation::{check_structure, PoisonReason};

pub mod state;

pub use state::{transition, Event, QuarantineState};

/// A record handed over to quarantine, with everything needed for a dead-letter snapshot.
#[derive(Debug, Clone)]
pub struct PoisonItem {
    pub origin: Origin,
    pub payload: Option<Vec<u8>>,
    /// The record's own id, if it decoded. Re-validation checks this and nothing else.
    pub record_id: Option<String>,
    pub reason: PoisonReason,
    pub first_failure: DateTime<Utc>,
}

impl PoisonItem {
    pub fn new(inbound: InboundRecord, reason: PoisonReason) -> Self {
        Self {
            record_id: inbound.record.map(|r| r.id),
            origin: inbound.origin,
            payload: inbound.payload,
            reason,
            first_failure: Utc::now(),
        }
    }

    fn known_device_id(&self) -> Option<&str> {
        let from_record = self.record_id.as_deref().filter(|id| !id.trim().is_empty());
        from_record.or_else(|| {
            self.origin
                .key
                .as_deref()
                .filter(|key| !key.trim().is_empty())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineOutcome {
    Recovered { attempts: u32 },
    DeadLettered { attempts: u32, delivered: bool },
}

impl QuarantineOutcome {
    /// True once nothing about the item can be lost anymore.
    pub fn is_durable(&self) -> bool {
        match self {
            QuarantineOutcome::Recovered { .. } => true,
            QuarantineOutcome::DeadLettered { delivered, .. } => *delivered,
        }
    }
}

struct Inner {
    sink: Arc<dyn RecordSink>,
    dead_letter_topic: String,
    policy: RetryPolicy,
    metrics: Arc<dyn PipelineMetrics>,
    shutdown: CancellationToken,
    synthesized_ids: AtomicU64,
}

#[derive(Clone)]
pub struct PoisonQuarantine {
    inner: Arc<Inner>,
    tracker: TaskTracker,
}

impl PoisonQuarantine {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        dead_letter_topic: impl Into<String>,
        policy: RetryPolicy,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                dead_letter_topic: dead_letter_topic.into(),
                policy,
                metrics,
                shutdown: CancellationToken::new(),
                synthesized_ids: AtomicU64::new(0),
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Schedules every item on its own task. The returned handles resolve once the item
    /// recovered or its dead-letter write was attempted.
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn submit(&self, items: Vec<PoisonItem>) -> Vec<JoinHandle<QuarantineOutcome>> {
        items
            .into_iter()
            .map(|item| {
                let inner = self.inner.clone();
                self.tracker.spawn(async move { inner.run(item).await })
            })
            .collect()
    }

    /// Runs one item to completion on the caller's task.
    pub async fn quarantine(&self, item: PoisonItem) -> QuarantineOutcome {
        self.inner.run(item).await
    }

    /// Number of items still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Interrupts pending backoffs and waits up to `timeout` for every item to reach a
    /// terminal state. Returns false if some items were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!(in_flight = self.tracker.len(), "shutting down quarantine");
        self.tracker.close();
        self.inner.shutdown.cancel();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                error!(
                    in_flight = self.tracker.len(),
                    "quarantine did not drain before the shutdown deadline"
                );
                false
            }
        }
    }
}

impl Inner {
    async fn run(&self, item: PoisonItem) -> QuarantineOutcome {
        self.metrics.increment(Counter::Poisoned, 1);
        debug!(
            topic = %item.origin.topic,
            partition = item.origin.partition,
            offset = item.origin.offset,
            reason = %item.reason,
            "quarantining poison message"
        );

        let mut state = QuarantineState::Received;
        let mut last_failure = item.first_failure;
        let mut last_error: Option<StructuralError> = None;

        loop {
            match state {
                QuarantineState::Received => {
                    let event = self.attempt(&item, &mut last_error, &mut last_failure);
                    state = transition(state, event, &self.policy);
                }
                QuarantineState::Retrying { backoff, .. } => {
                    let event = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            self.metrics.increment(Counter::RetriesAborted, 1);
                            last_failure = Utc::now();
                            Event::Cancelled
                        }
                        _ = tokio::time::sleep(backoff) => {
                            self.attempt(&item, &mut last_error, &mut last_failure)
                        }
                    };
                    state = transition(state, event, &self.policy);
                }
                QuarantineState::Recovered { attempts } => {
                    self.metrics.increment(Counter::Recovered, 1);
                    debug!(attempts, "poison message recovered, dropping it");
                    return QuarantineOutcome::Recovered { attempts };
                }
                QuarantineState::Exhausted { attempts, aborted } => {
                    let delivered = self
                        .dead_letter(&item, attempts, aborted, last_failure, last_error.as_ref())
                        .await;
                    return QuarantineOutcome::DeadLettered {
                        attempts,
                        delivered,
                    };
                }
            }
        }
    }

    fn attempt(
        &self,
        item: &PoisonItem,
        last_error: &mut Option<StructuralError>,
        last_failure: &mut DateTime<Utc>,
    ) -> Event {
        self.metrics.increment(Counter::RetryAttempts, 1);

        match check_structure(item.payload.as_deref(), item.record_id.as_deref()) {
            Ok(()) => Event::Passed,
            Err(e) => {
                debug!("re-validation failed: {}", e);
                *last_error = Some(e);
                *last_failure = Utc::now();
                Event::Failed
            }
        }
    }

    async fn dead_letter(
        &self,
        item: &PoisonItem,
        attempts: u32,
        aborted: bool,
        last_failure: DateTime<Utc>,
        last_error: Option<&StructuralError>,
    ) -> bool {
        let record = self.snapshot(item, attempts, aborted, last_failure, last_error);

        warn!(
            device_id = %record.device_id,
            error_kind = ErrorKind::Exhaustion.as_str(),
            attempts,
            aborted,
            "sending poison message to dead-letter topic"
        );

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize dead-letter record: {}", e);
                self.metrics.increment(Counter::DeadLetterFailed, 1);
                return false;
            }
        };

        match self
            .sink
            .send(&self.dead_letter_topic, record.partition_key(), payload)
            .await
        {
            Ok(()) => {
                self.metrics.increment(Counter::DeadLettered, 1);
                true
            }
            Err(e) => {
                error!(
                    device_id = %record.device_id,
                    topic = %self.dead_letter_topic,
                    "failed to write dead-letter record: {}",
                    e
                );
                self.metrics.increment(Counter::DeadLetterFailed, 1);
                false
            }
        }
    }

    fn snapshot(
        &self,
        item: &PoisonItem,
        attempts: u32,
        aborted: bool,
        last_failure: DateTime<Utc>,
        last_error: Option<&StructuralError>,
    ) -> QuarantinedRecord {
        let device_id = match item.known_device_id() {
            Some(id) => id.to_string(),
            None => self.synthesize_id(),
        };

        let metadata = json!({
            "source_service": SOURCE_SERVICE,
            "original_topic": item.origin.topic,
            "original_key": item.origin.key,
            "device_id": device_id,
            "timestamp": Utc::now().timestamp_millis(),
            "retry_exhausted": !aborted,
            "aborted": aborted,
            "last_check_error": last_error.map(|e| e.to_string()),
        });

        QuarantinedRecord {
            original_topic: item.origin.topic.clone(),
            original_partition: item.origin.partition,
            original_offset: item.origin.offset,
            original_key: item.origin.key.clone(),
            original_value: item
                .payload
                .as_ref()
                .map(|bytes| general_purpose::STANDARD.encode(bytes)),
            error_kind: item.reason.kind().as_str().to_string(),
            error_type: item.reason.error_type().to_string(),
            error_message: item.reason.to_string(),
            retry_attempts: attempts,
            first_failure_time: item.first_failure,
            last_failure_time: last_failure.max(item.first_failure),
            device_id,
            metadata: metadata.to_string(),
        }
    }

    fn synthesize_id(&self) -> String {
        let seq = self.synthesized_ids.fetch_add(1, Ordering::Relaxed);
        format!("unknown-device-{}-{}", Utc::now().timestamp_millis(), seq)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::metrics::CountingMetrics;
    use crate::test_utils::MemorySink;
    use crate::types::DeviceRecord;

    const DLT: &str = "device-ids-dlt";

    fn setup() -> (PoisonQuarantine, Arc<MemorySink>, Arc<CountingMetrics>) {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(CountingMetrics::new());
        let quarantine =
            PoisonQuarantine::new(sink.clone(), DLT, RetryPolicy::default(), metrics.clone());
        (quarantine, sink, metrics)
    }

    fn origin() -> Origin {
        Origin::new("device-ids", 2, 41)
    }

    fn dead_letters(sink: &MemorySink) -> Vec<QuarantinedRecord> {
        sink.messages_for(DLT)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_is_dead_lettered_once() {
        let (quarantine, sink, metrics) = setup();
        let inbound = InboundRecord::decode(origin(), Some(br#"{"id": "", "model": "m1"}"#));
        let item = PoisonItem::new(inbound, PoisonReason::MissingId);

        let started = tokio::time::Instant::now();
        let outcome = quarantine.quarantine(item).await;

        assert_eq!(
            outcome,
            QuarantineOutcome::DeadLettered {
                attempts: 3,
                delivered: true
            }
        );
        // 1s before the second attempt, 2s before the third
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));

        let written = dead_letters(&sink);
        assert_eq!(written.len(), 1);
        let record = &written[0];
        assert_eq!(record.retry_attempts, 3);
        assert!(record.first_failure_time <= record.last_failure_time);
        assert_eq!(record.error_type, "MissingId");
        assert_eq!(record.error_kind, "structural");
        assert_eq!(record.original_partition, 2);
        assert_eq!(record.original_offset, 41);
        assert_eq!(
            general_purpose::STANDARD
                .decode(record.original_value.as_ref().unwrap())
                .unwrap(),
            br#"{"id": "", "model": "m1"}"#
        );
        assert!(record.device_id.starts_with("unknown-device-"));

        let metadata: Value = serde_json::from_str(&record.metadata).unwrap();
        assert_eq!(metadata["source_service"], SOURCE_SERVICE);
        assert_eq!(metadata["retry_exhausted"], true);
        assert_eq!(metadata["aborted"], false);

        assert_eq!(metrics.get(Counter::Poisoned), 1);
        assert_eq!(metrics.get(Counter::RetryAttempts), 3);
        assert_eq!(metrics.get(Counter::DeadLettered), 1);
        assert_eq!(metrics.get(Counter::Recovered), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn well_formed_item_recovers_without_dead_letter() {
        let (quarantine, sink, metrics) = setup();
        let inbound = InboundRecord::from_record(origin(), DeviceRecord::new("d7"));
        let item = PoisonItem::new(inbound, PoisonReason::Storage("timed out".to_string()));

        let outcome = quarantine.quarantine(item).await;

        assert_eq!(outcome, QuarantineOutcome::Recovered { attempts: 1 });
        assert!(sink.messages().is_empty());
        assert_eq!(metrics.get(Counter::Recovered), 1);
        assert_eq!(metrics.get(Counter::DeadLettered), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_key_prefers_record_id_then_original_key() {
        let (quarantine, sink, _) = setup();

        // Passes the non-blank check but not the charset one
        let bad_charset = InboundRecord::from_record(origin(), DeviceRecord::new("bad id"));
        quarantine
            .quarantine(PoisonItem::new(
                bad_charset,
                PoisonReason::Storage("constraint".to_string()),
            ))
            .await;

        let keyed = InboundRecord::empty(origin().with_key("key-9"));
        quarantine
            .quarantine(PoisonItem::new(keyed, PoisonReason::EmptyMessage))
            .await;

        let keys: Vec<String> = sink.messages_for(DLT).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["bad id".to_string(), "key-9".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_payload_omits_original_value() {
        let (quarantine, sink, _) = setup();
        let item = PoisonItem::new(InboundRecord::empty(origin()), PoisonReason::EmptyMessage);

        quarantine.quarantine(item).await;

        let written = dead_letters(&sink);
        assert_eq!(written.len(), 1);
        assert!(written[0].original_value.is_none());
        let raw: Value = serde_json::from_slice(&sink.messages_for(DLT)[0].payload).unwrap();
        assert!(raw.get("originalValue").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dead_letter_write_is_counted_not_raised() {
        let (quarantine, sink, metrics) = setup();
        sink.fail_topic(DLT);
        let item = PoisonItem::new(InboundRecord::empty(origin()), PoisonReason::EmptyMessage);

        let outcome = quarantine.quarantine(item).await;

        assert_eq!(
            outcome,
            QuarantineOutcome::DeadLettered {
                attempts: 3,
                delivered: false
            }
        );
        assert!(!outcome.is_durable());
        assert_eq!(metrics.get(Counter::DeadLetterFailed), 1);
        assert_eq!(metrics.get(Counter::DeadLettered), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_items_run_in_the_background() {
        let (quarantine, sink, _) = setup();
        let items = vec![
            PoisonItem::new(InboundRecord::empty(origin()), PoisonReason::EmptyMessage),
            PoisonItem::new(
                InboundRecord::from_record(origin(), DeviceRecord::new("d8")),
                PoisonReason::Storage("timed out".to_string()),
            ),
        ];

        let handles = quarantine.submit(items);
        let outcomes: Vec<QuarantineOutcome> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(outcomes.contains(&QuarantineOutcome::Recovered { attempts: 1 }));
        assert!(outcomes.contains(&QuarantineOutcome::DeadLettered {
            attempts: 3,
            delivered: true
        }));
        assert_eq!(dead_letters(&sink).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_pending_backoff_and_dead_letters() {
        let (quarantine, sink, metrics) = setup();
        let item = PoisonItem::new(InboundRecord::empty(origin()), PoisonReason::EmptyMessage);

        let mut handles = quarantine.submit(vec![item]);
        // Let attempt 1 fail and park the task on its 1s backoff
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(quarantine.shutdown(Duration::from_secs(30)).await);

        let outcome = handles.remove(0).await.unwrap();
        assert_eq!(
            outcome,
            QuarantineOutcome::DeadLettered {
                attempts: 1,
                delivered: true
            }
        );
        assert_eq!(metrics.get(Counter::RetriesAborted), 1);

        let written = dead_letters(&sink);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].retry_attempts, 1);
        let metadata: Value = serde_json::from_str(&written[0].metadata).unwrap();
        assert_eq!(metadata["aborted"], true);
        assert_eq!(metadata["retry_exhausted"], false);
    }
}
