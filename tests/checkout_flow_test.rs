//! Checkout integration tests: cart-to-order conversion, frozen prices,
//! shipping rules, and the all-or-nothing reservation transaction.

mod common;

use axum::http::{Method, StatusCode};
use common::{as_decimal, response_json, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use uuid::Uuid;

fn checkout_payload() -> serde_json::Value {
    json!({
        "shipping_address": {
            "street": "1 Market St",
            "city": "Springfield",
            "postal_code": "12345",
            "country": "US"
        },
        "payment_method": "card"
    })
}

#[tokio::test]
async fn checkout_creates_order_and_reserves_stock() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let product_id = app.seed_product("Blue Widget", dec!(30), 5).await;

    app.request(
        Method::POST,
        "/api/cart/add",
        Some(&token),
        Some(json!({ "product_id": product_id, "quantity": 3 })),
    )
    .await;

    let response = app
        .request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(checkout_payload()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = response_json(response).await;
    let order = &body["data"];
    assert_eq!(order["status"], "pending");
    assert_eq!(order["is_paid"], false);
    assert_eq!(as_decimal(&order["items_price"]), dec!(90));
    // 90 is not strictly above the free-shipping threshold.
    assert_eq!(as_decimal(&order["shipping_price"]), dec!(10));
    assert_eq!(as_decimal(&order["total_price"]), dec!(100));

    let items = order["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 3);
    assert_eq!(as_decimal(&items[0]["price"]), dec!(30));

    assert_eq!(app.stock_of(product_id).await, 2);

    // The cart was emptied in the same transaction.
    let cart = response_json(app.request(Method::GET, "/api/cart", Some(&token), None).await).await;
    assert_eq!(cart["data"]["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn checkout_with_empty_cart_is_rejected() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());

    // Cart exists but is empty.
    app.request(Method::GET, "/api/cart", Some(&token), None).await;

    let response = app
        .request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(checkout_payload()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn checkout_without_any_cart_is_rejected() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());

    let response = app
        .request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(checkout_payload()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn checkout_requires_payment_method() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let product_id = app.seed_product("Blue Widget", dec!(10), 5).await;

    app.request(
        Method::POST,
        "/api/cart/add",
        Some(&token),
        Some(json!({ "product_id": product_id, "quantity": 1 })),
    )
    .await;

    let response = app
        .request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(json!({ "shipping_address": { "city": "Springfield" }, "payment_method": "" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn checkout_names_product_on_stock_shortfall_and_rolls_back() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let plenty = app.seed_product("Plentiful Widget", dec!(10), 50).await;
    let scarce = app.seed_product("Scarce Gadget", dec!(20), 5).await;

    for (id, qty) in [(plenty, 2), (scarce, 3)] {
        app.request(
            Method::POST,
            "/api/cart/add",
            Some(&token),
            Some(json!({ "product_id": id, "quantity": qty })),
        )
        .await;
    }

    // Stock shrinks underneath the cart before checkout.
    let product = app.state.services.products.get(scarce).await.unwrap();
    let mut active: storefront_api::entities::product::ActiveModel = product.into();
    active.stock = Set(1);
    active.update(&*app.state.db).await.expect("shrink stock");

    let response = app
        .request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(checkout_payload()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response_json(response).await;
    assert!(
        body["message"].as_str().unwrap().contains("Scarce Gadget"),
        "error should name the product: {}",
        body["message"]
    );

    // Nothing was reserved and the cart survived.
    assert_eq!(app.stock_of(plenty).await, 50);
    assert_eq!(app.stock_of(scarce).await, 1);
    let cart = response_json(app.request(Method::GET, "/api/cart", Some(&token), None).await).await;
    assert_eq!(cart["data"]["items"].as_array().unwrap().len(), 2);
    let orders =
        response_json(app.request(Method::GET, "/api/orders/myorders", Some(&token), None).await)
            .await;
    assert_eq!(orders["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn order_prices_are_frozen_at_creation() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let product_id = app.seed_product("Blue Widget", dec!(30), 5).await;

    app.request(
        Method::POST,
        "/api/cart/add",
        Some(&token),
        Some(json!({ "product_id": product_id, "quantity": 2 })),
    )
    .await;

    let created = response_json(
        app.request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(checkout_payload()),
        )
        .await,
    )
    .await;
    let order_id = created["data"]["id"].as_str().unwrap().to_string();

    // Reprice after the order exists.
    let product = app.state.services.products.get(product_id).await.unwrap();
    let mut active: storefront_api::entities::product::ActiveModel = product.into();
    active.price = Set(dec!(99));
    active.update(&*app.state.db).await.expect("reprice");

    let reread = response_json(
        app.request(
            Method::GET,
            &format!("/api/orders/{}", order_id),
            Some(&token),
            None,
        )
        .await,
    )
    .await;
    assert_eq!(as_decimal(&reread["data"]["items"][0]["price"]), dec!(30));
    assert_eq!(as_decimal(&reread["data"]["items_price"]), dec!(60));
}

#[tokio::test]
async fn order_above_threshold_ships_free() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let product_id = app.seed_product("Premium Widget", dec!(25.50), 10).await;

    app.request(
        Method::POST,
        "/api/cart/add",
        Some(&token),
        Some(json!({ "product_id": product_id, "quantity": 4 })),
    )
    .await;

    let body = response_json(
        app.request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(checkout_payload()),
        )
        .await,
    )
    .await;
    assert_eq!(as_decimal(&body["data"]["items_price"]), dec!(102));
    assert_eq!(as_decimal(&body["data"]["shipping_price"]), dec!(0));
    assert_eq!(as_decimal(&body["data"]["total_price"]), dec!(102));
}

#[tokio::test]
async fn shipping_address_is_stored_verbatim() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let product_id = app.seed_product("Blue Widget", dec!(10), 5).await;

    app.request(
        Method::POST,
        "/api/cart/add",
        Some(&token),
        Some(json!({ "product_id": product_id, "quantity": 1 })),
    )
    .await;

    let address = json!({
        "street": "1 Market St",
        "unit": "4B",
        "city": "Springfield",
        "country": "US"
    });
    let body = response_json(
        app.request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(json!({ "shipping_address": address, "payment_method": "card" })),
        )
        .await,
    )
    .await;
    assert_eq!(body["data"]["shipping_address"], address);
    assert_eq!(body["data"]["payment_method"], "card");
}

#[tokio::test]
async fn non_object_shipping_address_is_rejected() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());
    let product_id = app.seed_product("Blue Widget", dec!(10), 5).await;

    app.request(
        Method::POST,
        "/api/cart/add",
        Some(&token),
        Some(json!({ "product_id": product_id, "quantity": 1 })),
    )
    .await;

    let response = app
        .request(
            Method::POST,
            "/api/orders",
            Some(&token),
            Some(json!({ "shipping_address": "1 Market St", "payment_method": "card" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
