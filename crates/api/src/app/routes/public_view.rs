use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Token-scoped public invoice view.
///
/// Serves the reduced invoice JSON; `payment_url` is null until a
/// checkout session exists, which the page renders as view-only.
pub async fn view_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
) -> axum::response::Response {
    match services.invoices().find_by_token(&token) {
        Some(rm) => (StatusCode::OK, Json(dto::public_invoice_to_json(&rm))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "invoice not found"),
    }
}
