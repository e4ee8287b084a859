//! Read-only HTTP access to the entities persisted by the consumer.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use pipeline_common::metrics::{serve, setup_metrics_recorder};
use pipeline_common::store::PgStore;
use pipeline_common::telemetry::{MetricsTelemetry, Telemetry};

use config::Config;

mod config;
mod error;
mod handlers;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let telemetry: Arc<dyn Telemetry> = Arc::new(MetricsTelemetry);

    let store = PgStore::new(&config.database_url, config.max_pg_connections, telemetry).await?;
    let recorder = setup_metrics_recorder()?;
    let app = handlers::app(store, config.request_timeout.0, Some(recorder));

    let bind = config.bind();
    tracing::info!(bind = %bind, "starting pipeline api");
    if let Err(e) = serve(app, &bind).await {
        tracing::error!("failed to start pipeline-api http server, {}", e);
        return Err(e.into());
    }

    Ok(())
}
