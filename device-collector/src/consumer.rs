use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, MessageStream, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::health::HealthHandle;
use crate::ingestor::{AckDecision, BatchIngestor};
use crate::metrics_consts::{COMMIT_FAILED, CONSUMER_KAFKA_ERROR, DEDUP_CACHE_ENTRIES};
use crate::types::{InboundRecord, Origin};

pub struct CollectorConsumerContext {
    liveness: HealthHandle,
}

impl ClientContext for CollectorConsumerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for CollectorConsumerContext {
    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!("offset commit failed: {}", e);
            counter!(COMMIT_FAILED).increment(1);
        }
    }
}

/// Next offset to consume per (topic, partition): the highest offset seen in the batch plus one.
pub fn committable_offsets(records: &[InboundRecord]) -> BTreeMap<(String, i32), i64> {
    let mut offsets: BTreeMap<(String, i32), i64> = BTreeMap::new();
    for record in records {
        let next = record.origin.offset + 1;
        offsets
            .entry((record.origin.topic.clone(), record.origin.partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }
    offsets
}

fn decode_message<M: Message>(message: &M) -> InboundRecord {
    let mut origin = Origin::new(message.topic(), message.partition(), message.offset());
    if let Some(key) = message.key() {
        origin = origin.with_key(String::from_utf8_lossy(key));
    }
    InboundRecord::decode(origin, message.payload())
}

/// Polls the input topic in batches and commits a batch only when the ingestor says so.
///
/// Partition assignment is left to the consumer group, and batches are handled one at a
/// time, so records of a partition are always processed in offset order.
pub struct BatchConsumer {
    consumer: StreamConsumer<CollectorConsumerContext>,
    ingestor: Arc<BatchIngestor>,
    batch_size: usize,
    batch_timeout: Duration,
    liveness: HealthHandle,
}

impl BatchConsumer {
    pub fn new(
        config: &KafkaConfig,
        topic: &str,
        ingestor: Arc<BatchIngestor>,
        batch_size: usize,
        batch_timeout: Duration,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let context = CollectorConsumerContext {
            liveness: liveness.clone(),
        };
        let consumer: StreamConsumer<CollectorConsumerContext> = config
            .consumer_client_config()
            .create_with_context(context)?;

        consumer.subscribe(&[topic])?;
        info!(topic, "subscribed to input topic");

        Ok(Self {
            consumer,
            ingestor,
            batch_size,
            batch_timeout,
            liveness,
        })
    }

    /// Runs until `shutdown` fires or a fatal Kafka error occurs. A batch that is already
    /// being handled always completes before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), KafkaError> {
        info!("starting batch consumption");
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutdown requested, stopping consumption");
                    break;
                }

                batch = Self::consume_batch(&mut stream, self.batch_size, self.batch_timeout, &self.liveness) => {
                    let records = batch?;
                    if records.is_empty() {
                        continue;
                    }

                    let offsets = committable_offsets(&records);
                    match self.ingestor.on_batch(records).await {
                        AckDecision::Acknowledge => self.commit(&offsets),
                        AckDecision::Withhold => {
                            warn!(partitions = offsets.len(), "batch not acknowledged, leaving offsets uncommitted");
                        }
                        AckDecision::Empty => {}
                    }

                    metrics::gauge!(DEDUP_CACHE_ENTRIES)
                        .set(self.ingestor.dedup_entries() as f64);
                }
            }
        }

        Ok(())
    }

    fn commit(&self, offsets: &BTreeMap<(String, i32), i64>) {
        let mut list = TopicPartitionList::new();
        for ((topic, partition), next_offset) in offsets {
            if let Err(e) = list.add_partition_offset(topic, *partition, Offset::Offset(*next_offset)) {
                error!(topic = %topic, partition = *partition, "failed to build commit list: {}", e);
                counter!(COMMIT_FAILED).increment(1);
                return;
            }
        }

        match self.consumer.commit(&list, CommitMode::Async) {
            Ok(()) => debug!(partitions = offsets.len(), "committed batch offsets"),
            Err(e) => {
                warn!("failed to commit batch offsets: {}", e);
                counter!(COMMIT_FAILED).increment(1);
            }
        }
    }

    async fn consume_batch(
        stream: &mut MessageStream<'_, CollectorConsumerContext>,
        batch_size: usize,
        batch_timeout: Duration,
        liveness: &HealthHandle,
    ) -> KafkaResult<Vec<InboundRecord>> {
        let start = Instant::now();
        let mut batch = Vec::with_capacity(batch_size);
        let mut kafka_error_count = 0;

        let deadline = sleep(batch_timeout);
        tokio::pin!(deadline);

        liveness.report_healthy();

        while batch.len() < batch_size {
            tokio::select! {
                _ = &mut deadline => break,

                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        batch.push(decode_message(&message));
                        kafka_error_count = 0;
                    }
                    Some(Err(e)) => {
                        kafka_error_count += 1;
                        if let Some(fatal) = handle_kafka_error(e, kafka_error_count).await {
                            return Err(fatal);
                        }
                    }
                    None => break,
                }
            }
        }

        if !batch.is_empty() {
            debug!(
                size = batch.len(),
                collection_ms = start.elapsed().as_millis() as u64,
                "collected batch"
            );
        }
        Ok(batch)
    }
}

/// Logs and counts a consumer error, backing off for transient ones. Only errors that
/// should end consumption are returned.
async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumption(code) => {
            match code {
                RDKafkaErrorCode::PartitionEOF => {
                    counter!(CONSUMER_KAFKA_ERROR, &[("level", "info"), ("error", "partition_eof")])
                        .increment(1);
                }
                RDKafkaErrorCode::OperationTimedOut => {
                    counter!(CONSUMER_KAFKA_ERROR, &[("level", "info"), ("error", "op_timed_out")])
                        .increment(1);
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    // auto.offset.reset decides where we resume
                    warn!("offset out of range, seeking to the configured reset policy");
                    counter!(
                        CONSUMER_KAFKA_ERROR,
                        &[("level", "info"), ("error", "offset_out_of_range")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!("kafka consumer error: {code:?}");
                    counter!(CONSUMER_KAFKA_ERROR, &[("level", "warn"), ("error", "consumer")])
                        .increment(1);
                    sleep(Duration::from_millis(100 * current_count.min(10))).await;
                }
            }
            None
        }

        KafkaError::MessageConsumptionFatal(code) => {
            error!("fatal kafka consumer error: {code:?}");
            counter!(CONSUMER_KAFKA_ERROR, &[("level", "fatal"), ("error", "consumer")])
                .increment(1);
            Some(e)
        }

        KafkaError::Global(code) => {
            match code {
                RDKafkaErrorCode::AllBrokersDown => {
                    warn!("all brokers down, waiting for reconnect");
                    counter!(
                        CONSUMER_KAFKA_ERROR,
                        &[("level", "warn"), ("error", "all_brokers_down")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(5))).await;
                }
                RDKafkaErrorCode::Authentication => {
                    error!("kafka authentication failed: {code:?}");
                    counter!(
                        CONSUMER_KAFKA_ERROR,
                        &[("level", "fatal"), ("error", "authentication")]
                    )
                    .increment(1);
                    return Some(e);
                }
                _ => {
                    warn!("global kafka error: {code:?}");
                    counter!(CONSUMER_KAFKA_ERROR, &[("level", "warn"), ("error", "global")])
                        .increment(1);
                    sleep(Duration::from_millis(500 * current_count.min(6))).await;
                }
            }
            None
        }

        KafkaError::Canceled => {
            info!("consumer canceled");
            Some(e)
        }

        _ => {
            error!("unexpected kafka error: {:?}", e);
            counter!(CONSUMER_KAFKA_ERROR, &[("level", "fatal"), ("error", "unexpected")])
                .increment(1);
            sleep(Duration::from_millis(100 * current_count.min(10))).await;
            None
        }
    }
}
