//! Pipeline counters.
//!
//! Components never touch a global registry directly: each one is handed an
//! `Arc<dyn PipelineMetrics>` at construction. Production wiring uses
//! [`PrometheusMetrics`], which forwards to the `metrics` facade, and tests use
//! [`CountingMetrics`] to assert on exact counts.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::metrics_consts::{
    BATCHES_ACKED, BATCHES_RECEIVED, BATCHES_WITHHELD, DEAD_LETTERED, DEAD_LETTER_FAILED,
    POISON_TOTAL, PUBLISH_FAILED, PUBLISH_SENT, PUBLISH_SKIPPED, QUARANTINE_RECOVERED,
    RECORDS_PROCESSED, RECORDS_RECLASSIFIED, RETRIES_ABORTED, RETRY_ATTEMPTS, STORAGE_FAILURES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    BatchesReceived,
    BatchesAcked,
    BatchesWithheld,
    RecordsProcessed,
    RecordsReclassified,
    StorageFailures,
    PublishSent,
    PublishSkipped,
    PublishFailed,
    Poisoned,
    RetryAttempts,
    RetriesAborted,
    Recovered,
    DeadLettered,
    DeadLetterFailed,
}

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::BatchesReceived => BATCHES_RECEIVED,
            Counter::BatchesAcked => BATCHES_ACKED,
            Counter::BatchesWithheld => BATCHES_WITHHELD,
            Counter::RecordsProcessed => RECORDS_PROCESSED,
            Counter::RecordsReclassified => RECORDS_RECLASSIFIED,
            Counter::StorageFailures => STORAGE_FAILURES,
            Counter::PublishSent => PUBLISH_SENT,
            Counter::PublishSkipped => PUBLISH_SKIPPED,
            Counter::PublishFailed => PUBLISH_FAILED,
            Counter::Poisoned => POISON_TOTAL,
            Counter::RetryAttempts => RETRY_ATTEMPTS,
            Counter::RetriesAborted => RETRIES_ABORTED,
            Counter::Recovered => QUARANTINE_RECOVERED,
            Counter::DeadLettered => DEAD_LETTERED,
            Counter::DeadLetterFailed => DEAD_LETTER_FAILED,
        }
    }
}

pub trait PipelineMetrics: Send + Sync {
    fn increment(&self, counter: Counter, value: u64);

    fn record_batch(&self, _size: usize, _elapsed_ms: f64) {}
}

/// Forwards to whatever recorder the `metrics` facade has installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl PipelineMetrics for PrometheusMetrics {
    fn increment(&self, counter: Counter, value: u64) {
        metrics::counter!(counter.name()).increment(value);
    }

    fn record_batch(&self, size: usize, elapsed_ms: f64) {
        metrics::histogram!(crate::metrics_consts::BATCH_SIZE).record(size as f64);
        metrics::histogram!(crate::metrics_consts::BATCH_PROCESSING_TIME).record(elapsed_ms);
    }
}

/// Keeps counts in memory.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counts: Mutex<HashMap<Counter, u64>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts
            .lock()
            .map(|counts| counts.get(&counter).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl PipelineMetrics for CountingMetrics {
    fn increment(&self, counter: Counter, value: u64) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(counter).or_insert(0) += value;
        }
    }
}
