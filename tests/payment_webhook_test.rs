//! Payment integration tests: intent creation from frozen totals and
//! replay-safe webhook reconciliation.

mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{response_json, TestApp, TEST_WEBHOOK_SECRET};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use storefront_api::services::payments::sign_payload;
use uuid::Uuid;

fn checkout_payload() -> Value {
    json!({
        "shipping_address": { "city": "Springfield" },
        "payment_method": "card"
    })
}

async fn place_order(app: &TestApp, token: &str, quantity: i32, stock: i32) -> (Uuid, String) {
    let product_id = app.seed_product("Blue Widget", dec!(10), stock).await;
    app.request(
        Method::POST,
        "/api/cart/add",
        Some(token),
        Some(json!({ "product_id": product_id, "quantity": quantity })),
    )
    .await;
    let body = response_json(
        app.request(
            Method::POST,
            "/api/orders",
            Some(token),
            Some(checkout_payload()),
        )
        .await,
    )
    .await;
    let order_id = body["data"]["id"].as_str().expect("order id").to_string();
    (product_id, order_id)
}

fn payment_event(event_type: &str, order_id: &str, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": {
            "object": {
                "id": "pi_test",
                "status": status,
                "metadata": { "order_id": order_id },
                "update_time": "2026-08-24T12:00:00Z",
                "email_address": "shopper@example.com"
            }
        }
    }))
    .expect("event body")
}

fn signed(body: &[u8]) -> String {
    sign_payload(TEST_WEBHOOK_SECRET, Utc::now().timestamp(), body)
}

async fn fetch_order(app: &TestApp, token: &str, order_id: &str) -> Value {
    let body = response_json(
        app.request(
            Method::GET,
            &format!("/api/orders/{}", order_id),
            Some(token),
            None,
        )
        .await,
    )
    .await;
    body["data"].clone()
}

#[tokio::test]
async fn create_intent_uses_the_frozen_total() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    // 2 x 10.00 + 10.00 shipping = 30.00
    let (_, order_id) = place_order(&app, &token, 2, 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/payment/create-payment-intent",
            Some(&token),
            Some(json!({ "order_id": order_id })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    let intent = &body["data"];
    assert!(intent["payment_intent_id"].as_str().unwrap().starts_with("pi_"));
    assert!(intent["client_secret"].as_str().unwrap().contains("_secret_"));
    assert_eq!(intent["amount"], 3000);
    assert_eq!(intent["currency"], "usd");
}

#[tokio::test]
async fn create_intent_is_owner_only() {
    let app = TestApp::new().await;
    let owner = app.customer_token(Uuid::new_v4());
    let stranger = app.customer_token(Uuid::new_v4());
    let admin = app.admin_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &owner, 1, 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/payment/create-payment-intent",
            Some(&stranger),
            Some(json!({ "order_id": order_id })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A charge binds to the shopper's own session; not even an admin may
    // open an intent on someone else's order.
    let response = app
        .request(
            Method::POST,
            "/api/payment/create-payment-intent",
            Some(&admin),
            Some(json!({ "order_id": order_id })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn create_intent_rejects_paid_orders() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &token, 1, 5).await;

    let event = payment_event("payment_intent.succeeded", &order_id, "succeeded");
    let accepted = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(accepted.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            "/api/payment/create-payment-intent",
            Some(&token),
            Some(json!({ "order_id": order_id })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn succeeded_event_marks_the_order_paid() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &token, 1, 5).await;

    let event = payment_event("payment_intent.succeeded", &order_id, "succeeded");
    let response = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["received"], true);

    let order = fetch_order(&app, &token, &order_id).await;
    assert_eq!(order["is_paid"], true);
    assert_eq!(order["status"], "processing");
    assert!(order["paid_at"].as_str().is_some());
    assert_eq!(order["payment_result"]["id"], "pi_test");
}

#[tokio::test]
async fn duplicate_succeeded_event_is_idempotent() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &token, 1, 5).await;

    let event = payment_event("payment_intent.succeeded", &order_id, "succeeded");
    let first = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(first.status(), StatusCode::OK);

    let after_first = fetch_order(&app, &token, &order_id).await;
    let original_paid_at = after_first["paid_at"].as_str().unwrap().to_string();

    // Redelivery of the same event.
    let second = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(second.status(), StatusCode::OK);

    let after_second = fetch_order(&app, &token, &order_id).await;
    assert_eq!(after_second["is_paid"], true);
    assert_eq!(after_second["status"], "processing");
    assert_eq!(after_second["paid_at"], original_paid_at.as_str());
}

#[tokio::test]
async fn failed_event_cancels_a_pending_order_and_returns_stock() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (product_id, order_id) = place_order(&app, &token, 3, 5).await;
    assert_eq!(app.stock_of(product_id).await, 2);

    let event = payment_event("payment_intent.payment_failed", &order_id, "failed");
    let response = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = fetch_order(&app, &token, &order_id).await;
    assert_eq!(order["status"], "cancelled");
    assert_eq!(order["is_paid"], false);
    assert_eq!(app.stock_of(product_id).await, 5);
}

#[tokio::test]
async fn failed_event_after_cancellation_is_a_no_op() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (product_id, order_id) = place_order(&app, &token, 2, 5).await;

    let cancelled = app
        .request(
            Method::POST,
            &format!("/api/orders/{}/cancel", order_id),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(app.stock_of(product_id).await, 5);

    // The processor's failure notice arrives late; it must acknowledge
    // without releasing stock a second time.
    let event = payment_event("payment_intent.payment_failed", &order_id, "failed");
    let response = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = fetch_order(&app, &token, &order_id).await;
    assert_eq!(order["status"], "cancelled");
    assert_eq!(app.stock_of(product_id).await, 5);
}

#[tokio::test]
async fn failed_event_leaves_a_paid_order_alone() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (product_id, order_id) = place_order(&app, &token, 2, 5).await;

    let paid = payment_event("payment_intent.succeeded", &order_id, "succeeded");
    app.post_webhook(paid.clone(), Some(&signed(&paid))).await;

    let failed = payment_event("payment_intent.payment_failed", &order_id, "failed");
    let response = app.post_webhook(failed.clone(), Some(&signed(&failed))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = fetch_order(&app, &token, &order_id).await;
    assert_eq!(order["status"], "processing");
    assert_eq!(order["is_paid"], true);
    assert_eq!(app.stock_of(product_id).await, 3, "reservation stands");
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &token, 1, 5).await;

    let event = payment_event("payment_intent.created", &order_id, "requires_payment_method");
    let response = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = fetch_order(&app, &token, &order_id).await;
    assert_eq!(order["status"], "pending");
}

#[tokio::test]
async fn webhook_without_signature_is_rejected() {
    let app = TestApp::new().await;
    let event = payment_event("payment_intent.succeeded", &Uuid::new_v4().to_string(), "succeeded");

    let response = app.post_webhook(event, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &token, 1, 5).await;

    let event = payment_event("payment_intent.succeeded", &order_id, "succeeded");
    let header = sign_payload("whsec_some_other_secret", Utc::now().timestamp(), &event);

    let response = app.post_webhook(event, Some(&header)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let order = fetch_order(&app, &token, &order_id).await;
    assert_eq!(order["is_paid"], false, "forged event must not apply");
}

#[tokio::test]
async fn webhook_with_stale_timestamp_is_rejected() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let (_, order_id) = place_order(&app, &token, 1, 5).await;

    let event = payment_event("payment_intent.succeeded", &order_id, "succeeded");
    let header = sign_payload(TEST_WEBHOOK_SECRET, Utc::now().timestamp() - 3600, &event);

    let response = app.post_webhook(event, Some(&header)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_event_for_unknown_order_is_acknowledged() {
    let app = TestApp::new().await;

    // Signature checks out, but the order id is nothing we know. Rejecting
    // it would only make the processor redeliver forever, so the endpoint
    // acknowledges and moves on.
    let event = payment_event(
        "payment_intent.succeeded",
        &Uuid::new_v4().to_string(),
        "succeeded",
    );
    let response = app.post_webhook(event.clone(), Some(&signed(&event))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["received"], true);

    let failed = payment_event(
        "payment_intent.payment_failed",
        &Uuid::new_v4().to_string(),
        "failed",
    );
    let response = app.post_webhook(failed.clone(), Some(&signed(&failed))).await;
    assert_eq!(response.status(), StatusCode::OK);
}
