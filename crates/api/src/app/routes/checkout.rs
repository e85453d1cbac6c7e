use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;

use billflow_billing::{AttachPaymentLink, InvoiceCommand, PublicToken};
use billflow_core::{AggregateId, DomainError, UserId};
use billflow_payments::build_session_spec;

use crate::app::routes::common::record_activity;
use crate::app::routes::invoices::parse_invoice_id;
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::PrincipalContext;

/// Staff-side checkout session creation.
pub async fn create_checkout_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    create_session_for(&services, agg, Some(principal.user_id()), Some(&headers)).await
}

/// Unauthenticated checkout session creation, scoped by public token.
pub async fn create_checkout_session_public(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> axum::response::Response {
    let Some(rm) = services.invoices().find_by_token(&token) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "invoice not found");
    };
    create_session_for(&services, rm.invoice_id.0, None, Some(&headers)).await
}

async fn create_session_for(
    services: &AppServices,
    aggregate_id: AggregateId,
    actor: Option<UserId>,
    headers: Option<&HeaderMap>,
) -> axum::response::Response {
    let invoice = match services.load_invoice(aggregate_id).await {
        Ok(Some(invoice)) => invoice,
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", "invoice not found");
        }
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    // Reuse the issued token; otherwise this candidate becomes the
    // invoice's token when the link is attached.
    let token = invoice
        .public_token()
        .cloned()
        .unwrap_or_else(PublicToken::generate);

    let spec = match build_session_spec(&invoice, &token, &services.config.public_base_url) {
        Ok(spec) => spec,
        Err(DomainError::Validation(msg)) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg);
        }
        Err(e) => {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                e.to_string(),
            );
        }
    };

    let session = match services.checkout_gateway.create_session(&spec).await {
        Ok(session) => session,
        Err(e) => return errors::gateway_error_to_response(e),
    };

    let cmd = InvoiceCommand::AttachPaymentLink(AttachPaymentLink {
        invoice_id: invoice.id_typed(),
        session_id: session.id.clone(),
        session_url: session.url.clone(),
        token,
        occurred_at: Utc::now(),
    });
    if let Err(e) = services.dispatch_invoice(aggregate_id, cmd).await {
        return errors::dispatch_error_to_response(e);
    }

    record_activity(
        services,
        actor,
        headers,
        "checkout_session_created",
        "payments",
        format!("checkout session for invoice {}", invoice.invoice_number()),
        Some(invoice.id_typed().to_string()),
        serde_json::json!({ "payment_link_id": session.id }),
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "payment_url": session.url,
            "payment_link_id": session.id,
        })),
    )
        .into_response()
}
