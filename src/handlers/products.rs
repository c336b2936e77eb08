use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::errors::{ApiError, ServiceError};
use crate::handlers::common::{
    created_response, map_service_error, success_response, validate_input,
};
use crate::services::products::CreateProductInput;
use crate::AppState;

/// Creates the router for catalog endpoints
pub fn products_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route("/:id", get(get_product))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub stock: i32,
}

/// List all products
async fn list_products(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let products = state
        .services
        .products
        .list()
        .await
        .map_err(map_service_error)?;

    Ok(success_response(products))
}

/// Get a single product
async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let product = state
        .services
        .products
        .get(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(product))
}

/// Create a product (admin only)
async fn create_product(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !user.is_admin() {
        return Err(map_service_error(ServiceError::Forbidden(
            "Only administrators may create products".to_string(),
        )));
    }
    validate_input(&payload)?;

    let product = state
        .services
        .products
        .create(CreateProductInput {
            name: payload.name,
            description: payload.description,
            price: payload.price,
            stock: payload.stock,
        })
        .await
        .map_err(map_service_error)?;

    Ok(created_response(product))
}
