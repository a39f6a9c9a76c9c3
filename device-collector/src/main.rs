use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use device_collector::config::Config;
use device_collector::consumer::BatchConsumer;
use device_collector::dedup::DedupCache;
use device_collector::health::HealthRegistry;
use device_collector::ingestor::BatchIngestor;
use device_collector::metrics::{PipelineMetrics, PrometheusMetrics};
use device_collector::publisher::PublishGateway;
use device_collector::quarantine::PoisonQuarantine;
use device_collector::server::{router, serve, setup_metrics_recorder};
use device_collector::sinks::{KafkaSink, PrintSink, RecordSink};
use device_collector::storage::PostgresDeviceStore;

fn setup_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter).boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = router(liveness, Some(recorder));
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("health and metrics server stopped: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    setup_tracing(config.log_json);
    config.validate().context("invalid configuration")?;
    info!("starting device collector");

    let liveness = HealthRegistry::new("liveness");
    let server = start_server(&config, liveness.clone())?;

    let metrics: Arc<dyn PipelineMetrics> = Arc::new(PrometheusMetrics);

    let store = PostgresDeviceStore::connect_lazy(&config.database_url, config.max_pg_connections)
        .context("failed to build postgres pool")?;
    store
        .migrate()
        .await
        .context("failed to run database migrations")?;

    let kafka_sink = if config.print_sink {
        None
    } else {
        let producer_liveness =
            liveness.register("rdkafka_producer".to_string(), Duration::from_secs(30));
        Some(
            KafkaSink::new(&config.kafka, producer_liveness)
                .context("failed to create kafka producer")?,
        )
    };
    let sink: Arc<dyn RecordSink> = match &kafka_sink {
        Some(producer) => Arc::new(producer.clone()),
        None => Arc::new(PrintSink {}),
    };

    let publisher = PublishGateway::new(
        DedupCache::new(config.dedup.dedup_max_entries, config.dedup.ttl()),
        sink.clone(),
        config.topics.output_topic.as_str(),
        metrics.clone(),
    );
    let quarantine = PoisonQuarantine::new(
        sink,
        config.topics.dead_letter_topic.as_str(),
        config.retry_policy.policy(),
        metrics.clone(),
    );
    let ingestor = Arc::new(BatchIngestor::new(
        Arc::new(store),
        publisher,
        quarantine.clone(),
        config.ack_policy,
        metrics,
    ));

    let consumer_liveness = liveness.register(
        "consumer_loop".to_string(),
        config.batch_timeout.0 * 4 + Duration::from_secs(30),
    );
    let consumer = BatchConsumer::new(
        &config.kafka,
        config.topics.input_topic.as_str(),
        ingestor,
        config.batch_size,
        config.batch_timeout.0,
        consumer_liveness,
    )
    .context("failed to create kafka consumer")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let consumed = consumer.run(shutdown).await;

    if !quarantine
        .shutdown(config.quarantine_shutdown_timeout.0)
        .await
    {
        warn!("some quarantined messages were still in flight at exit");
    }
    if let Some(producer) = kafka_sink {
        if let Err(e) = producer.flush(Duration::from_secs(10)) {
            warn!("failed to flush kafka producer: {}", e);
        }
    }
    server.abort();

    consumed.context("kafka consumer stopped with a fatal error")?;
    info!("device collector stopped");
    Ok(())
}
