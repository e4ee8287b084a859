//! Publish rounds of linked sample events to the pipeline topic.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use pipeline_common::telemetry::{MetricsTelemetry, Telemetry};
use pipeline_producer::config::Config;
use pipeline_producer::producer::EventProducer;
use pipeline_producer::samples::SampleGenerator;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("invalid log directive")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let telemetry: Arc<dyn Telemetry> = Arc::new(MetricsTelemetry);
    let producer = EventProducer::new(&config, telemetry)?;
    let mut generator = SampleGenerator::new();

    let mut published = 0;
    let mut failed = 0;
    for round in 0..config.sample_event_count {
        for event in generator.round() {
            match producer.publish(&event).await {
                Ok(_) => published += 1,
                Err(e) => {
                    warn!(round, error = %e, "sample event not published");
                    failed += 1;
                }
            }
        }
    }

    producer.flush(Duration::from_secs(30))?;
    info!(published, failed, "sample events done");

    Ok(())
}
