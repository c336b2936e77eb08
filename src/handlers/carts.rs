use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::errors::ApiError;
use crate::handlers::common::{map_service_error, success_response, validate_input};
use crate::AppState;

/// Creates the router for cart endpoints. The cart is per-user and created
/// lazily, so every route keys off the authenticated caller.
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/add", post(add_to_cart))
        .route(
            "/items/:product_id",
            put(update_cart_item).delete(remove_cart_item),
        )
        .route("/clear", delete(clear_cart))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1))]
    pub quantity: i32,
}

/// Get the caller's cart, creating it on first access
async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .get_cart(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Add a product to the cart, merging quantities
async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .add_item(user.user_id, payload.product_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Set the quantity of a cart line
async fn update_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .set_item_quantity(user.user_id, product_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Remove a line from the cart
async fn remove_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .remove_item(user.user_id, product_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Empty the cart
async fn clear_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .clear(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}
