//! Consume domain events from Kafka into Postgres, parking failures in a dead letter queue.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use pipeline_common::dead_letter::{DeadLetterSink, MemoryDeadLetterQueue, RedisDeadLetterQueue};
use pipeline_common::metrics::{add_metrics_routes, serve, setup_metrics_recorder};
use pipeline_common::store::PgStore;
use pipeline_common::telemetry::{MetricsTelemetry, Telemetry};
use pipeline_consumer::config::Config;
use pipeline_consumer::consumer::EventConsumer;
use pipeline_consumer::processor::EventProcessor;
use pipeline_consumer::rate::{RateCounter, RateSampler};
use pipeline_consumer::source::KafkaSource;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("invalid log directive")),
    );
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

pub async fn index() -> &'static str {
    "event pipeline consumer"
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let telemetry: Arc<dyn Telemetry> = Arc::new(MetricsTelemetry);

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register("consumer", time::Duration::seconds(30));
    let sampler_liveness = liveness.register("rate-sampler", time::Duration::seconds(30));

    let recorder = setup_metrics_recorder()?;
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = add_metrics_routes(router, Some(recorder));
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let store = PgStore::new(
        &config.database_url,
        config.max_pg_connections,
        telemetry.clone(),
    )
    .await?;

    let dead_letters: Arc<dyn DeadLetterSink> = if config.print_dead_letters {
        Arc::new(MemoryDeadLetterQueue::new(telemetry.clone()))
    } else {
        Arc::new(
            RedisDeadLetterQueue::new(
                &config.redis_url,
                config.dead_letter_key.as_str(),
                config.dead_letter_timeout.0,
                telemetry.clone(),
            )
            .await?,
        )
    };

    let source = KafkaSource::new(&config.kafka, config.kafka_consumer_group.as_str())?;

    let rates = Arc::new(RateCounter::default());
    let processor = EventProcessor::new(
        Arc::new(store),
        dead_letters,
        telemetry.clone(),
        rates.clone(),
        config.store_timeout.0,
    );
    let consumer = EventConsumer::new(
        Arc::new(source),
        processor,
        config.poll_timeout.0,
        consumer_liveness,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        if shutdown_tx.send(true).is_err() {
            info!("consumer already stopped");
        }
    });

    let sampler = RateSampler::new(
        rates,
        telemetry,
        config.rate_interval.0,
        sampler_liveness,
    );
    let sampler = tokio::spawn(sampler.run(shutdown_rx.clone()));

    info!(
        topic = config.kafka.kafka_topic.as_str(),
        group_id = config.kafka_consumer_group.as_str(),
        "consumer started"
    );
    consumer.run(shutdown_rx).await;
    sampler.await?;

    Ok(())
}
