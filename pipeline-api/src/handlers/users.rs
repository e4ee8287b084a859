use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use pipeline_common::store::{PgStore, UserRecord, UserWithOrders};

use crate::error::ApiError;

#[derive(Deserialize, Debug, Default)]
pub struct ListParams {
    /// Anything that is not a number in range falls back to the default size.
    limit: Option<String>,
}

pub async fn get(
    State(store): State<PgStore>,
    Path(user_id): Path<String>,
) -> Result<Json<UserWithOrders>, ApiError> {
    match store.get_user_with_orders(&user_id).await? {
        Some(user) => Ok(Json(user)),
        None => Err(ApiError::NotFound {
            entity: "user",
            id: user_id,
        }),
    }
}

pub async fn list(
    State(store): State<PgStore>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<UserRecord>>, ApiError> {
    let limit = params.limit.and_then(|limit| limit.parse::<i64>().ok());
    Ok(Json(store.get_recent_users(limit).await?))
}
