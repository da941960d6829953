use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::coordinator::{OrderCoordinator, PlaceOrderError, Reconciliation};
use crate::store::{OrderStore, OrderStoreError};

/// Set by the authentication layer in front of this service and trusted
/// verbatim.
pub const CUSTOMER_HEADER: &str = "x-customer-id";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: OrderCoordinator,
    pub orders: Arc<dyn OrderStore>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Set on system failures: whether reserved stock was handed back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<Reconciliation>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/status", put(update_status))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn error(status: StatusCode, message: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            reconciliation: None,
        }),
    )
}

fn placement_error(err: PlaceOrderError) -> ApiError {
    let status = match &err {
        PlaceOrderError::Invalid(_) => StatusCode::BAD_REQUEST,
        PlaceOrderError::NotFound { .. } => StatusCode::NOT_FOUND,
        PlaceOrderError::VersionConflict { .. } | PlaceOrderError::Cancelled { .. } => {
            StatusCode::CONFLICT
        }
        PlaceOrderError::InsufficientInventory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PlaceOrderError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PlaceOrderError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let reconciliation = (!err.is_client_error()).then(|| err.reconciliation());

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            reconciliation,
        }),
    )
}

fn store_error(err: OrderStoreError) -> ApiError {
    match err {
        OrderStoreError::NotFound(_) => error(StatusCode::NOT_FOUND, err),
        OrderStoreError::InvalidTransition { .. } | OrderStoreError::IntentClosed { .. } => {
            error(StatusCode::CONFLICT, err)
        }
        OrderStoreError::Database(_) => {
            tracing::error!("Order store failure: {}", err);
            error(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

fn customer_id(headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get(CUSTOMER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "missing or invalid customer id"))
}

/// The placement keeps running to completion (or compensation) if the client
/// disconnects and this handler is dropped.
pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderRecord>), ApiError> {
    let customer_id = customer_id(&headers)?;

    match state.coordinator.place_order(customer_id, request.items).await {
        Ok(order) => Ok((StatusCode::CREATED, Json(order))),
        Err(e) => {
            if e.is_client_error() {
                tracing::info!(customer_id, "Order rejected: {}", e);
            } else {
                tracing::error!(customer_id, reconciliation = ?e.reconciliation(), "Order placement failed: {}", e);
            }
            Err(placement_error(e))
        }
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderRecord>, ApiError> {
    state
        .orders
        .get_order(order_id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("order {order_id} not found")))
}

/// Lists the calling customer's orders, newest first.
pub async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrderRecord>>, ApiError> {
    let customer_id = customer_id(&headers)?;

    state
        .orders
        .list_orders(customer_id)
        .await
        .map(Json)
        .map_err(store_error)
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<OrderRecord>, ApiError> {
    state
        .orders
        .update_status(order_id, request.status)
        .await
        .map(Json)
        .map_err(store_error)
}

pub async fn health_check() -> &'static str {
    "OK"
}
