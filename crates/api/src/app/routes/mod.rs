use axum::{Router, routing::get};

pub mod admin;
pub mod auth;
pub mod checkout;
pub mod common;
pub mod invoices;
pub mod public_view;
pub mod stock;
pub mod system;
pub mod webhook;

/// Router for all authenticated (staff) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/billing/invoices", invoices::router())
        .nest("/admin", admin::router())
}
