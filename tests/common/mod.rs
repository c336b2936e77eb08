#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request},
    response::Response,
    Router,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use storefront_api::{
    auth::{issue_token, Role},
    config::AppConfig,
    db,
    events::{self, EventSender},
    services::products::CreateProductInput,
    AppState,
};

pub const TEST_JWT_SECRET: &str =
    "integration_test_jwt_secret_0123456789_abcdefghijklmnopqrstuvwxyz_ABCDEF";
pub const TEST_WEBHOOK_SECRET: &str = "whsec_integration_test_secret";

/// Test harness: the full router backed by a throwaway SQLite file.
///
/// The pool is capped at one connection so concurrent requests serialize at
/// the database instead of tripping SQLite's write-lock errors.
pub struct TestApp {
    pub state: AppState,
    router: Router,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let db_dir = TempDir::new().expect("temp dir for test database");
        let db_path = db_dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            TEST_JWT_SECRET.to_string(),
            TEST_WEBHOOK_SECRET.to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), Arc::new(cfg), event_sender);
        let router = storefront_api::app_router().with_state(state.clone());

        Self {
            state,
            router,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    /// Mints a customer token for the given user id.
    pub fn customer_token(&self, user_id: Uuid) -> String {
        issue_token(user_id, Role::Customer, TEST_JWT_SECRET, 3600).expect("token")
    }

    /// Mints an admin token.
    pub fn admin_token(&self, user_id: Uuid) -> String {
        issue_token(user_id, Role::Admin, TEST_JWT_SECRET, 3600).expect("token")
    }

    /// Sends a request through the full router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).expect("json body")))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    /// Posts a raw body to the webhook endpoint with the given signature
    /// header.
    pub async fn post_webhook(&self, body: Vec<u8>, signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/payment/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header("payment-signature", signature);
        }

        self.router
            .clone()
            .oneshot(builder.body(Body::from(body)).expect("request"))
            .await
            .expect("router response")
    }

    /// Seeds a catalog product directly through the service layer.
    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        self.state
            .services
            .products
            .create(CreateProductInput {
                name: name.to_string(),
                description: None,
                price,
                stock,
            })
            .await
            .expect("seed product")
            .id
    }

    /// Reads the product's current stock.
    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        self.state
            .services
            .inventory
            .available(product_id)
            .await
            .expect("product stock")
    }
}

/// Decodes a response body as JSON.
pub async fn response_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Parses a decimal field that may arrive as a JSON string or number.
pub fn as_decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("expected a decimal, got {:?}", other),
    }
}
