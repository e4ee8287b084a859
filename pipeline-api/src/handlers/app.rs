use std::time::Duration;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use pipeline_common::metrics::add_metrics_routes;
use pipeline_common::store::PgStore;

use super::{health, orders, users};

pub fn app(store: PgStore, request_timeout: Duration, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/health", routing::get(health::get))
        .route("/users", routing::get(users::list))
        .route("/users/:id", routing::get(users::get))
        .route("/orders/:id", routing::get(orders::get))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(store);

    add_metrics_routes(router, metrics)
}

pub async fn index() -> &'static str {
    "event pipeline api"
}
