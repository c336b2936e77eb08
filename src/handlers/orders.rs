use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::order::OrderStatus;
use crate::errors::{ApiError, ServiceError};
use crate::handlers::common::{
    created_response, map_service_error, success_response, validate_input,
};
use crate::services::checkout::CreateOrderInput;
use crate::AppState;

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_all_orders))
        .route("/myorders", get(list_my_orders))
        .route("/:id", get(get_order))
        .route("/:id/status", put(update_order_status))
        .route("/:id/cancel", post(cancel_order))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub shipping_address: Value,
    #[validate(length(min = 1, message = "Payment method is required"))]
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

/// Create an order from the caller's cart
async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    if !payload.shipping_address.is_object() {
        return Err(ApiError::ValidationError(
            "shipping_address must be an object".to_string(),
        ));
    }

    let order = state
        .services
        .checkout
        .create_order(
            user.user_id,
            CreateOrderInput {
                shipping_address: payload.shipping_address,
                payment_method: payload.payment_method,
            },
        )
        .await
        .map_err(map_service_error)?;

    Ok(created_response(order))
}

/// Get one order; owner or admin only
async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .checkout
        .get_order(id, &user)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}

/// List the caller's orders
async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state
        .services
        .orders
        .list_for_user(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(orders))
}

/// List all orders (admin only)
async fn list_all_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    if !user.is_admin() {
        return Err(map_service_error(ServiceError::Forbidden(
            "Only administrators may list all orders".to_string(),
        )));
    }

    let orders = state
        .services
        .orders
        .list_all()
        .await
        .map_err(map_service_error)?;

    Ok(success_response(orders))
}

/// Force a status transition (admin only).
///
/// Cancellation must release reserved stock, so a requested `cancelled`
/// status routes through the checkout cancel path; everything else goes
/// through the plain state machine.
async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !user.is_admin() {
        return Err(map_service_error(ServiceError::Forbidden(
            "Only administrators may update order status".to_string(),
        )));
    }

    let order = if payload.status == OrderStatus::Cancelled {
        state
            .services
            .checkout
            .cancel_order(id, &user)
            .await
            .map_err(map_service_error)?
    } else {
        state
            .services
            .orders
            .update_status(id, payload.status)
            .await
            .map_err(map_service_error)?
    };

    Ok(success_response(order))
}

/// Cancel a pending order; owner or admin only
async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .checkout
        .cancel_order(id, &user)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}
