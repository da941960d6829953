use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use shared::*;

use crate::service::InventoryService;

pub type ApiError = (StatusCode, Json<InventoryError>);

pub fn create_router(service: InventoryService) -> Router {
    Router::new()
        .route("/inventory", post(create_product))
        .route("/inventory/lookup", post(lookup))
        .route("/inventory/adjust-many", post(adjust_many))
        .route(
            "/inventory/:product_id",
            get(get_inventory).delete(delete_product),
        )
        .route("/inventory/:product_id/adjust", post(adjust))
        .route("/inventory/reservations/:key/release", post(release))
        .route("/health", get(health_check))
        .with_state(service)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub fn status_for(err: &InventoryError) -> StatusCode {
    match err {
        InventoryError::NotFound { .. } => StatusCode::NOT_FOUND,
        InventoryError::VersionConflict { .. } => StatusCode::CONFLICT,
        InventoryError::InsufficientInventory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        InventoryError::Released { .. } => StatusCode::GONE,
        InventoryError::Invalid { .. } => StatusCode::BAD_REQUEST,
        InventoryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        InventoryError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: InventoryError) -> ApiError {
    if !err.is_rejection() {
        tracing::error!("Inventory request failed: {}", err);
    }
    (status_for(&err), Json(err))
}

pub async fn create_product(
    State(service): State<InventoryService>,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<InventoryRecord>), ApiError> {
    let record = service
        .create_product(request.product_id, request.quantity)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn get_inventory(
    State(service): State<InventoryService>,
    Path(product_id): Path<i64>,
) -> Result<Json<InventoryRecord>, ApiError> {
    service.get_inventory(product_id).await.map(Json).map_err(reject)
}

pub async fn delete_product(
    State(service): State<InventoryService>,
    Path(product_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.delete_product(product_id).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn lookup(
    State(service): State<InventoryService>,
    Json(request): Json<LookupRequest>,
) -> Result<Json<LookupResponse>, ApiError> {
    let inventories = service
        .get_inventories(&request.product_ids)
        .await
        .map_err(reject)?;
    Ok(Json(LookupResponse { inventories }))
}

pub async fn adjust(
    State(service): State<InventoryService>,
    Path(product_id): Path<i64>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<AdjustmentResult>, ApiError> {
    service
        .adjust(product_id, request.delta, request.expected_version)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn adjust_many(
    State(service): State<InventoryService>,
    Json(request): Json<AdjustManyRequest>,
) -> Result<Json<AdjustManyResponse>, ApiError> {
    let results = service
        .adjust_many(request.idempotency_key, request.adjustments)
        .await
        .map_err(reject)?;
    Ok(Json(AdjustManyResponse { results }))
}

pub async fn release(
    State(service): State<InventoryService>,
    Path(key): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let restored = service.release(&key).await.map_err(reject)?;
    Ok(Json(ReleaseResponse {
        idempotency_key: key,
        restored,
    }))
}

pub async fn health_check() -> &'static str {
    "OK"
}
