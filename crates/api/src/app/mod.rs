//! HTTP API application wiring (Axum router + service wiring).
//!
//! Folder layout:
//! - `services.rs`: infrastructure wiring (event store/bus, projections,
//!   dispatcher, external adapters)
//! - `reconcile.rs`: the webhook-driven payment reconciliation pipeline
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get, routing::post};
use tower::ServiceBuilder;

use crate::config::AppConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod reconcile;
pub mod routes;
pub mod services;

/// Build the full HTTP router with adapters derived from configuration.
pub async fn build_app(config: AppConfig) -> Router {
    let adapters = services::ExternalAdapters::from_config(&config);
    build_app_with(config, adapters).await
}

/// Build the router with explicit external adapters (tests inject
/// recording fakes here).
pub async fn build_app_with(config: AppConfig, adapters: services::ExternalAdapters) -> Router {
    let services = Arc::new(services::build_services(config, adapters).await);

    let auth_state = middleware::AuthState {
        tokens: services.tokens.clone(),
    };

    // Protected routes: staff session required.
    let protected = routes::router()
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // Public surface: health, login, the signed webhook and the
    // token-scoped public invoice view.
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/auth/login", post(routes::auth::login))
        .route("/webhooks/payments", post(routes::webhook::payment_webhook))
        .route(
            "/public/invoices/:token",
            get(routes::public_view::view_invoice),
        )
        .route(
            "/public/invoices/:token/checkout-session",
            post(routes::checkout::create_checkout_session_public),
        )
        .merge(protected)
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
