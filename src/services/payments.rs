//! Payment gateway adapter.
//!
//! Creates payment intents for frozen order totals and reconciles the
//! processor's asynchronous webhook events with order state. Webhook
//! payloads are trusted only after their HMAC signature verifies against
//! the shared secret; events may be redelivered, so every handler here is
//! safe to replay.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::checkout::CheckoutService;
use crate::services::orders::OrderService;

type HmacSha256 = Hmac<Sha256>;

/// Payment intent handed to the client to complete the charge out-of-band.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentIntentResponse {
    pub payment_intent_id: String,
    pub client_secret: String,
    /// Amount in the processor's minor units (cents).
    pub amount: i64,
    pub currency: String,
}

/// Decoded webhook event, shaped like the processor's envelope:
/// `{id, type, data: {object: {...}}}`.
#[derive(Debug, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: PaymentEventData,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEventData {
    pub object: PaymentObject,
}

#[derive(Debug, Deserialize)]
pub struct PaymentObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub metadata: PaymentMetadata,
    #[serde(default)]
    pub update_time: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaymentMetadata {
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Clone)]
pub struct PaymentService {
    config: Arc<AppConfig>,
    event_sender: EventSender,
    orders: OrderService,
    checkout: CheckoutService,
}

impl PaymentService {
    pub fn new(
        config: Arc<AppConfig>,
        event_sender: EventSender,
        orders: OrderService,
        checkout: CheckoutService,
    ) -> Self {
        Self {
            config,
            event_sender,
            orders,
            checkout,
        }
    }

    /// Creates a payment intent for an order.
    ///
    /// The amount is always derived from the order's frozen `total_price`,
    /// never from client input. Fails with `AlreadyPaid` on a paid order and
    /// `Forbidden` when the caller does not own it.
    #[instrument(skip(self, acting_user), fields(order_id = %order_id, user_id = %acting_user.user_id))]
    pub async fn create_intent(
        &self,
        order_id: Uuid,
        acting_user: &AuthUser,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        let order = self.orders.get_model(order_id).await?;

        // Strictly owner-only; an intent binds the charge to the shopper's
        // own session, so there is no admin path here.
        if order.user_id != acting_user.user_id {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        if order.is_paid {
            return Err(ServiceError::AlreadyPaid(format!(
                "Order {} is already paid",
                order_id
            )));
        }

        let amount = to_minor_units(order.total_price)?;
        let payment_intent_id = format!("pi_{}", Uuid::new_v4().simple());
        let client_secret = format!("{}_secret_{}", payment_intent_id, Uuid::new_v4().simple());

        self.event_sender
            .send_or_log(Event::PaymentIntentCreated {
                order_id,
                payment_intent_id: payment_intent_id.clone(),
            })
            .await;

        info!(order_id = %order_id, amount = amount, "payment intent created");

        Ok(PaymentIntentResponse {
            payment_intent_id,
            client_secret,
            amount,
            currency: "usd".to_string(),
        })
    }

    /// Verifies a webhook's signature and decodes the event.
    ///
    /// The header carries `t=<unix_ts>,v1=<hex hmac>`; the MAC is computed
    /// over `"<ts>.<raw body>"` with the shared secret and compared in
    /// constant time. The timestamp must be within the configured tolerance.
    pub fn verify_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<PaymentEvent, ServiceError> {
        let (timestamp, signature) = parse_signature_header(signature_header)?;

        let now = Utc::now().timestamp();
        if (now - timestamp).unsigned_abs() > self.config.payment_webhook_tolerance_secs {
            return Err(ServiceError::SignatureInvalid(
                "Webhook timestamp outside tolerance".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.config.payment_webhook_secret.as_bytes())
            .map_err(|_| {
                ServiceError::InternalError("Webhook secret unusable as HMAC key".to_string())
            })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        if !constant_time_eq(&expected, &signature) {
            return Err(ServiceError::SignatureInvalid(
                "Webhook signature mismatch".to_string(),
            ));
        }

        serde_json::from_slice(payload)
            .map_err(|e| ServiceError::ValidationError(format!("Malformed webhook payload: {}", e)))
    }

    /// Applies a verified event to order state.
    ///
    /// `payment_intent.succeeded` marks the order paid (idempotent);
    /// `payment_intent.payment_failed` cancels the order iff it is still
    /// pending. Unknown event kinds are logged and acknowledged so the
    /// processor stops redelivering them.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn handle_event(&self, event: PaymentEvent) -> Result<(), ServiceError> {
        let order_id = event
            .data
            .object
            .metadata
            .order_id
            .as_deref()
            .ok_or_else(|| {
                ServiceError::ValidationError("Webhook event carries no order_id".to_string())
            })
            .and_then(|raw| {
                Uuid::parse_str(raw).map_err(|_| {
                    ServiceError::ValidationError(format!("Invalid order_id in webhook: {}", raw))
                })
            })?;

        // A verified event that names an order this shop does not know is
        // acknowledged, not rejected: returning an error would only make
        // the processor redeliver something we can never apply.
        match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let payment_result = json!({
                    "id": event.data.object.id,
                    "status": event.data.object.status,
                    "update_time": event.data.object.update_time,
                    "email_address": event.data.object.email_address,
                });
                match self.orders.mark_paid(order_id, payment_result).await {
                    Ok(_) => {}
                    Err(ServiceError::NotFound(_)) => {
                        warn!(order_id = %order_id, "payment succeeded for an unknown order; acknowledging");
                    }
                    Err(e) => return Err(e),
                }
            }
            "payment_intent.payment_failed" => {
                self.event_sender
                    .send_or_log(Event::PaymentFailed(order_id))
                    .await;
                match self.checkout.cancel_if_pending(order_id).await {
                    Ok(true) => {
                        info!(order_id = %order_id, "order cancelled after failed payment");
                    }
                    Ok(false) => {
                        info!(order_id = %order_id, "failed payment for a non-pending order; no-op");
                    }
                    Err(ServiceError::NotFound(_)) => {
                        warn!(order_id = %order_id, "payment failed for an unknown order; acknowledging");
                    }
                    Err(e) => return Err(e),
                }
            }
            other => {
                warn!(event_type = %other, "unhandled payment event type");
            }
        }

        Ok(())
    }
}

/// Converts a decimal amount into the processor's minor-unit convention.
fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| {
            ServiceError::InternalError(format!("Order total {} not representable", amount))
        })
}

fn parse_signature_header(header: &str) -> Result<(i64, String), ServiceError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(ts), Some(sig)) => Ok((ts, sig)),
        _ => Err(ServiceError::SignatureInvalid(
            "Malformed signature header".to_string(),
        )),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Test helper: signs a payload the way the processor would.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn service() -> PaymentService {
        let config = Arc::new(AppConfig::new(
            "sqlite://:memory:".to_string(),
            "unit_test_jwt_secret_0123456789_abcdefghijklmnopqrstuvwxyz_ABCDEFGH".to_string(),
            "whsec_unit_test_secret".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        ));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let event_sender = EventSender::new(tx);
        let db = Arc::new(sea_orm::DatabaseConnection::Disconnected);
        let orders = OrderService::new(db.clone(), event_sender.clone());
        let carts = crate::services::carts::CartService::new(db.clone(), event_sender.clone());
        let inventory = crate::services::inventory::InventoryService::new(db.clone());
        let checkout = CheckoutService::new(
            db,
            event_sender.clone(),
            carts,
            orders.clone(),
            inventory,
        );
        PaymentService::new(config, event_sender, orders, checkout)
    }

    fn event_body(order_id: Uuid) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_abc",
                    "status": "succeeded",
                    "metadata": { "order_id": order_id.to_string() },
                    "update_time": "2024-06-01T00:00:00Z",
                    "email_address": "shopper@example.com"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn valid_signature_decodes_event() {
        let svc = service();
        let order_id = Uuid::new_v4();
        let body = event_body(order_id);
        let header = sign_payload("whsec_unit_test_secret", Utc::now().timestamp(), &body);

        let event = svc.verify_event(&body, &header).unwrap();
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(
            event.data.object.metadata.order_id.as_deref(),
            Some(order_id.to_string().as_str())
        );
    }

    #[test]
    fn tampered_payload_rejected() {
        let svc = service();
        let body = event_body(Uuid::new_v4());
        let header = sign_payload("whsec_unit_test_secret", Utc::now().timestamp(), &body);

        let mut tampered = body.clone();
        tampered[0] ^= 0x01;
        assert_matches!(
            svc.verify_event(&tampered, &header),
            Err(ServiceError::SignatureInvalid(_))
        );
    }

    #[test]
    fn wrong_secret_rejected() {
        let svc = service();
        let body = event_body(Uuid::new_v4());
        let header = sign_payload("some_other_secret", Utc::now().timestamp(), &body);

        assert_matches!(
            svc.verify_event(&body, &header),
            Err(ServiceError::SignatureInvalid(_))
        );
    }

    #[test]
    fn stale_timestamp_rejected() {
        let svc = service();
        let body = event_body(Uuid::new_v4());
        let stale = Utc::now().timestamp() - 3600;
        let header = sign_payload("whsec_unit_test_secret", stale, &body);

        assert_matches!(
            svc.verify_event(&body, &header),
            Err(ServiceError::SignatureInvalid(_))
        );
    }

    #[test]
    fn malformed_header_rejected() {
        let svc = service();
        let body = event_body(Uuid::new_v4());

        assert_matches!(
            svc.verify_event(&body, "v1=deadbeef"),
            Err(ServiceError::SignatureInvalid(_))
        );
        assert_matches!(
            svc.verify_event(&body, "garbage"),
            Err(ServiceError::SignatureInvalid(_))
        );
    }

    #[test]
    fn minor_unit_conversion_rounds_to_cents() {
        assert_eq!(to_minor_units(dec!(19.99)).unwrap(), 1999);
        assert_eq!(to_minor_units(dec!(100)).unwrap(), 10000);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
        assert_eq!(to_minor_units(dec!(0)).unwrap(), 0);
    }

    #[test]
    fn signature_header_parses_in_any_order() {
        let (ts, sig) = parse_signature_header("v1=cafe, t=1700000000").unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(sig, "cafe");
    }
}
