use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Latency buckets shared by every histogram, from 1ms to 10s.
const LATENCY_SECONDS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Bind a `TcpListener` on `bind` and serve `router` until the process exits.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the process-wide Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)?
        .install_recorder()
}

/// Add `/metrics` to `router` and count every request it serves.
/// Without a handle the route answers with a placeholder, which keeps tests
/// free of the global recorder.
pub fn add_metrics_routes(router: Router, handle: Option<PrometheusHandle>) -> Router {
    router
        .route(
            "/metrics",
            get(move || {
                std::future::ready(match handle {
                    Some(ref handle) => handle.render(),
                    None => "no metrics recorder installed".to_owned(),
                })
            }),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Record request count and latency per route and status code.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
