use axum::extract::{Path, State};
use axum::Json;

use pipeline_common::store::{OrderWithPayment, PgStore};

use crate::error::ApiError;

pub async fn get(
    State(store): State<PgStore>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderWithPayment>, ApiError> {
    store
        .get_order_with_payment(&order_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound {
            entity: "order",
            id: order_id,
        })
}
