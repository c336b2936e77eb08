//! Storefront API Library
//!
//! This crate provides the transactional core of the storefront backend:
//! catalog, per-user carts, checkout with atomic stock reservation, the
//! order lifecycle, and payment-processor reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod pricing;
pub mod services;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use http::StatusCode;
use serde_json::json;
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: events::EventSender,
    pub services: services::AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<db::DbPool>,
        config: Arc<config::AppConfig>,
        event_sender: events::EventSender,
    ) -> Self {
        let services =
            services::AppServices::new(db.clone(), config.clone(), event_sender.clone());
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}

/// Liveness/readiness probe; verifies the database pool answers a ping.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match db::check_connection(&state.db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected",
                "timestamp": Utc::now().to_rfc3339(),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "unreachable",
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
        }
    }
}

/// Full API router: every business route nested under `/api`, plus the
/// health probe at the root.
pub fn app_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes())
}

/// Business routes, grouped by resource.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/products", handlers::products::products_routes())
        .nest("/cart", handlers::carts::carts_routes())
        .nest("/orders", handlers::orders::orders_routes())
        .nest("/payment", handlers::payments::payments_routes())
}
