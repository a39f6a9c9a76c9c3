use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_include;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use device_collector::config::AckPolicy;
use device_collector::dedup::DedupCache;
use device_collector::ingestor::{AckDecision, BatchIngestor};
use device_collector::metrics::{Counter, CountingMetrics};
use device_collector::publisher::PublishGateway;
use device_collector::quarantine::PoisonQuarantine;
use device_collector::retry::RetryPolicy;
use device_collector::storage::{DeviceStore, MemoryDeviceStore};
use device_collector::test_utils::{FailingStore, MemorySink};
use device_collector::types::{DeviceRecord, InboundRecord, Origin, QuarantinedRecord};

const INPUT: &str = "device-ids";
const OUTPUT: &str = "device-info";
const DLT: &str = "device-ids-dlt";

struct Harness {
    ingestor: BatchIngestor,
    sink: Arc<MemorySink>,
    metrics: Arc<CountingMetrics>,
}

impl Harness {
    fn new(store: Arc<dyn DeviceStore>, ack_policy: AckPolicy) -> Self {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(CountingMetrics::new());
        let publisher = PublishGateway::new(
            DedupCache::new(10_000, Duration::from_secs(24 * 60 * 60)),
            sink.clone(),
            OUTPUT,
            metrics.clone(),
        );
        let quarantine =
            PoisonQuarantine::new(sink.clone(), DLT, RetryPolicy::default(), metrics.clone());
        let ingestor =
            BatchIngestor::new(store, publisher, quarantine, ack_policy, metrics.clone());

        Self {
            ingestor,
            sink,
            metrics,
        }
    }

    async fn drain_quarantine(&self) {
        assert!(
            self.ingestor
                .quarantine()
                .shutdown(Duration::from_secs(60))
                .await
        );
    }

    fn dead_letters(&self) -> Vec<QuarantinedRecord> {
        self.sink
            .messages_for(DLT)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }
}

fn message(offset: i64, payload: Value) -> InboundRecord {
    let bytes = serde_json::to_vec(&payload).unwrap();
    InboundRecord::decode(Origin::new(INPUT, 0, offset), Some(&bytes))
}

#[tokio::test(start_paused = true)]
async fn mixed_batch_is_acknowledged_and_poison_quarantined() {
    let store = Arc::new(MemoryDeviceStore::new());
    let harness = Harness::new(store.clone(), AckPolicy::AnySuccess);

    let decision = harness
        .ingestor
        .on_batch(vec![
            message(0, json!({"id": "d1", "kind": "sensor", "status": "online"})),
            message(1, json!({"id": "", "kind": "sensor"})),
        ])
        .await;

    assert_eq!(decision, AckDecision::Acknowledge);
    assert_eq!(store.upsert_count(), 1);
    assert!(store.get("d1").is_some());

    let published = harness.sink.messages_for(OUTPUT);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, "d1");
    let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_json_include!(
        actual: body,
        expected: json!({
            "id": "d1",
            "kind": "sensor",
            "status": "online",
            "meta": {"source": "device-collector"}
        })
    );

    harness.drain_quarantine().await;
    assert_eq!(harness.metrics.get(Counter::Poisoned), 1);
    let dead = harness.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_offset, 1);
    assert_eq!(dead[0].error_type, "MissingId");
}

#[tokio::test(start_paused = true)]
async fn all_poison_batch_is_not_acknowledged() {
    let store = Arc::new(MemoryDeviceStore::new());
    let harness = Harness::new(store.clone(), AckPolicy::AnySuccess);

    let decision = harness
        .ingestor
        .on_batch(vec![
            message(0, json!({"id": null})),
            message(1, json!({"id": "  "})),
        ])
        .await;

    assert_eq!(decision, AckDecision::Withhold);
    assert!(store.is_empty());
    assert!(harness.sink.messages_for(OUTPUT).is_empty());

    harness.drain_quarantine().await;
    assert_eq!(harness.metrics.get(Counter::Poisoned), 2);
    assert_eq!(harness.metrics.get(Counter::BatchesWithheld), 1);
}

#[tokio::test]
async fn repeated_device_is_published_once_but_stored_each_time() {
    let store = Arc::new(MemoryDeviceStore::new());
    let harness = Harness::new(store.clone(), AckPolicy::AnySuccess);

    for offset in 0..2 {
        let decision = harness
            .ingestor
            .on_batch(vec![message(offset, json!({"id": "d2"}))])
            .await;
        assert_eq!(decision, AckDecision::Acknowledge);
    }

    assert_eq!(store.upsert_count(), 2);
    assert_eq!(harness.sink.messages_for(OUTPUT).len(), 1);
    assert_eq!(harness.metrics.get(Counter::PublishSkipped), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_poison_is_dead_lettered_exactly_once() {
    let harness = Harness::new(Arc::new(MemoryDeviceStore::new()), AckPolicy::AnySuccess);
    let origin = Origin::new(INPUT, 4, 17).with_key("k-17");

    harness
        .ingestor
        .on_batch(vec![
            InboundRecord::decode(origin, Some(br#"{"model": "m1"}"#)),
            message(18, json!({"id": "d4"})),
        ])
        .await;
    harness.drain_quarantine().await;

    let dead = harness.dead_letters();
    assert_eq!(dead.len(), 1);
    let record = &dead[0];
    assert_eq!(record.retry_attempts, 3);
    assert!(record.first_failure_time <= record.last_failure_time);
    assert_eq!(record.device_id, "k-17");
    assert_eq!(record.original_partition, 4);
    assert_eq!(record.original_key.as_deref(), Some("k-17"));
    assert_eq!(harness.sink.messages_for(DLT)[0].key, "k-17");
    assert_eq!(harness.metrics.get(Counter::RetryAttempts), 3);
    assert_eq!(harness.metrics.get(Counter::DeadLettered), 1);
}

#[tokio::test]
async fn first_seen_is_never_moved_forward() {
    let store = Arc::new(MemoryDeviceStore::new());
    let harness = Harness::new(store.clone(), AckPolicy::AnySuccess);
    let t1 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let t2 = Utc.timestamp_millis_opt(1_700_000_600_000).unwrap();

    harness
        .ingestor
        .on_batch(vec![message(
            0,
            json!({"id": "d3", "firstSeen": t1.timestamp_millis(), "lastSeen": t1.timestamp_millis()}),
        )])
        .await;
    harness
        .ingestor
        .on_batch(vec![message(
            1,
            json!({"id": "d3", "firstSeen": t2.timestamp_millis(), "lastSeen": t2.timestamp_millis()}),
        )])
        .await;

    let stored: DeviceRecord = store.get("d3").unwrap();
    assert_eq!(stored.first_seen, Some(t1));
    assert_eq!(stored.last_seen, Some(t2));
}

#[tokio::test(start_paused = true)]
async fn storage_failure_reclassifies_the_record() {
    let store = Arc::new(FailingStore::new());
    store.fail_id("d9");
    let harness = Harness::new(store.clone(), AckPolicy::AnySuccess);

    let decision = harness
        .ingestor
        .on_batch(vec![message(0, json!({"id": "d9"}))])
        .await;

    assert_eq!(decision, AckDecision::Withhold);
    assert!(store.inner().is_empty());
    assert!(harness.sink.messages_for(OUTPUT).is_empty());
    assert_eq!(harness.metrics.get(Counter::RecordsReclassified), 1);
    assert_eq!(harness.metrics.get(Counter::StorageFailures), 1);

    // Well formed, so quarantine recovers it without a dead-letter write
    harness.drain_quarantine().await;
    assert_eq!(harness.metrics.get(Counter::Recovered), 1);
    assert!(harness.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_dead_lettered_with_raw_bytes() {
    let harness = Harness::new(Arc::new(MemoryDeviceStore::new()), AckPolicy::AnySuccess);

    harness
        .ingestor
        .on_batch(vec![InboundRecord::decode(
            Origin::new(INPUT, 0, 5),
            Some(b"{\"id\": \"d1\""),
        )])
        .await;
    harness.drain_quarantine().await;

    let dead = harness.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error_type, "MalformedPayload");
    assert_eq!(dead[0].error_kind, "structural");
    assert!(dead[0].original_value.is_some());
    assert!(dead[0].device_id.starts_with("unknown-device-"));
}

#[tokio::test(start_paused = true)]
async fn after_quarantine_policy_waits_for_dead_letter_delivery() {
    let harness = Harness::new(
        Arc::new(MemoryDeviceStore::new()),
        AckPolicy::AfterQuarantine,
    );

    let decision = harness
        .ingestor
        .on_batch(vec![
            message(0, json!({"id": "d1"})),
            message(1, json!({"id": ""})),
        ])
        .await;

    // The poison item was already dead-lettered by the time the decision was made
    assert_eq!(decision, AckDecision::Acknowledge);
    assert_eq!(harness.dead_letters().len(), 1);
    assert_eq!(harness.metrics.get(Counter::DeadLettered), 1);
}

#[tokio::test(start_paused = true)]
async fn after_quarantine_policy_withholds_when_dead_letter_fails() {
    let harness = Harness::new(
        Arc::new(MemoryDeviceStore::new()),
        AckPolicy::AfterQuarantine,
    );
    harness.sink.fail_topic(DLT);

    let decision = harness
        .ingestor
        .on_batch(vec![
            message(0, json!({"id": "d1"})),
            message(1, json!({"id": ""})),
        ])
        .await;

    assert_eq!(decision, AckDecision::Withhold);
    assert_eq!(harness.metrics.get(Counter::DeadLetterFailed), 1);
    // The valid record was still stored and published
    assert_eq!(harness.sink.messages_for(OUTPUT).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_publish_still_acknowledges_the_batch() {
    let store = Arc::new(MemoryDeviceStore::new());
    let harness = Harness::new(store.clone(), AckPolicy::AnySuccess);
    harness.sink.fail_topic(OUTPUT);

    let decision = harness
        .ingestor
        .on_batch(vec![message(0, json!({"id": "d6"}))])
        .await;

    assert_eq!(decision, AckDecision::Acknowledge);
    assert!(store.get("d6").is_some());
    assert!(harness.sink.messages_for(OUTPUT).is_empty());
    assert_eq!(harness.sink.attempts(), 1);
    assert_eq!(harness.metrics.get(Counter::PublishFailed), 1);
    assert_eq!(harness.metrics.get(Counter::RecordsReclassified), 0);

    harness.drain_quarantine().await;
    assert_eq!(harness.metrics.get(Counter::Poisoned), 0);
    assert!(harness.dead_letters().is_empty());
}
