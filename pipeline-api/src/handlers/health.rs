use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    time: String,
}

pub async fn get() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}
