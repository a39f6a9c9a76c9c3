use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::SinkError;
use crate::health::HealthHandle;
use crate::sinks::RecordSink;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("device_collector_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("device_collector_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "device_collector_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "device_collector_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

/// Produces to Kafka and waits for the broker acknowledgment of each message.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<KafkaSink, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let client_config = config.producer_client_config();
        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaSink { producer })
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic,
                payload: Some(&payload),
                partition: None,
                key: Some(key),
                timestamp: None,
                headers: None,
            })
            .map_err(|(e, _)| {
                error!("failed to enqueue message for {}: {}", topic, e);
                SinkError::Produce(e)
            })?;

        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(SinkError::Canceled),
            Ok(Err((e, _))) => Err(SinkError::Produce(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}
