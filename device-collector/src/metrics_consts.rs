pub const BATCHES_RECEIVED: &str = "device_collector_batches_received";
pub const BATCHES_ACKED: &str = "device_collector_batches_acked";
pub const BATCHES_WITHHELD: &str = "device_collector_batches_withheld";
pub const BATCH_SIZE: &str = "device_collector_batch_size";
pub const BATCH_PROCESSING_TIME: &str = "device_collector_batch_processing_time_ms";
pub const RECORDS_PROCESSED: &str = "device_collector_records_processed";
pub const RECORDS_RECLASSIFIED: &str = "device_collector_records_reclassified";
pub const STORAGE_FAILURES: &str = "device_collector_storage_failures";
pub const PUBLISH_SENT: &str = "device_collector_publish_sent";
pub const PUBLISH_SKIPPED: &str = "device_collector_publish_skipped_duplicate";
pub const PUBLISH_FAILED: &str = "device_collector_publish_failed";
pub const POISON_TOTAL: &str = "device_collector_poison_messages_total";
pub const RETRY_ATTEMPTS: &str = "device_collector_retry_attempts_total";
pub const RETRIES_ABORTED: &str = "device_collector_retries_aborted_total";
pub const QUARANTINE_RECOVERED: &str = "device_collector_quarantine_recovered_total";
pub const DEAD_LETTERED: &str = "device_collector_dead_lettered_total";
pub const DEAD_LETTER_FAILED: &str = "device_collector_dead_letter_failed_total";
pub const CONSUMER_KAFKA_ERROR: &str = "device_collector_consumer_kafka_error";
pub const COMMIT_FAILED: &str = "device_collector_commit_failed";
pub const DEDUP_CACHE_ENTRIES: &str = "device_collector_dedup_cache_entries";
