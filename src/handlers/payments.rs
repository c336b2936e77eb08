use axum::{
    extract::{Json, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::errors::{ApiError, ServiceError};
use crate::handlers::common::{map_service_error, success_response};
use crate::AppState;

/// Creates the router for payment endpoints
pub fn payments_routes() -> Router<AppState> {
    Router::new()
        .route("/create-payment-intent", post(create_payment_intent))
        .route("/webhook", post(payment_webhook))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateIntentRequest {
    pub order_id: Uuid,
}

/// Create a payment intent for an order's frozen total
#[utoipa::path(
    post,
    path = "/api/payment/create-payment-intent",
    request_body = CreateIntentRequest,
    responses(
        (status = 200, description = "Payment intent created", body = crate::services::payments::PaymentIntentResponse),
        (status = 400, description = "Order already paid", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the order's owner", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
async fn create_payment_intent(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let intent = state
        .services
        .payments
        .create_intent(payload.order_id, &user)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(intent))
}

/// Payment-processor webhook.
///
/// Takes the raw body so signature verification sees exactly the bytes that
/// were signed; JSON parsing happens only after the signature checks out.
/// Replies 200 for every verified event, handled or not, so the processor
/// stops redelivering.
#[utoipa::path(
    post,
    path = "/api/payment/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 400, description = "Signature verification failed", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get("payment-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            warn!("payment webhook without signature header");
            ServiceError::SignatureInvalid("Missing signature header".to_string())
        })?;

    let event = state
        .services
        .payments
        .verify_event(&body, signature)
        .map_err(|e| {
            warn!(error = %e, "payment webhook rejected");
            e
        })?;

    state.services.payments.handle_event(event).await?;

    Ok(axum::Json(json!({ "received": true })))
}
