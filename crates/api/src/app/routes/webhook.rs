use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;

use billflow_payments::parse_event;

use crate::app::reconcile::{ReconcileOutcome, process_gateway_event};
use crate::app::routes::common::record_activity;
use crate::app::services::AppServices;
use crate::app::errors;

/// Signed POST from the payment gateway.
///
/// 400 on signature or processing failure (the gateway retries those);
/// 200 `{received: true}` on everything handled or deliberately ignored.
pub async fn payment_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let Some(verifier) = services.verifier() else {
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "configuration_error",
            "webhook secret is not configured",
        );
    };

    let signature = headers
        .get("stripe-signature")
        .and_then(|h| h.to_str().ok());
    let Some(signature) = signature else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "authentication_failed",
            "missing signature header",
        );
    };

    // Fails closed: nothing below runs on a bad signature.
    if let Err(e) = verifier.verify(&body, signature, Utc::now()) {
        tracing::warn!("webhook signature rejected: {e}");
        return errors::json_error(StatusCode::BAD_REQUEST, "authentication_failed", e.to_string());
    }

    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(e) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("unparseable event envelope: {e}"),
            );
        }
    };

    match process_gateway_event(&services, event).await {
        Ok(outcome) => {
            audit_outcome(&services, &headers, &outcome);
            (
                StatusCode::OK,
                Json(serde_json::json!({ "received": true })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("webhook processing failed: {e:?}");
            errors::json_error(
                StatusCode::BAD_REQUEST,
                "processing_error",
                format!("{e:?}"),
            )
        }
    }
}

fn audit_outcome(services: &AppServices, headers: &HeaderMap, outcome: &ReconcileOutcome) {
    let (action, target, details) = match outcome {
        ReconcileOutcome::Processed { invoice_id, stock } => (
            "payment_reconciled",
            Some(invoice_id.to_string()),
            serde_json::json!({ "stock": stock.map(|s| s.as_str()) }),
        ),
        ReconcileOutcome::FailureRecorded { invoice_id } => (
            "payment_failure_recorded",
            Some(invoice_id.to_string()),
            serde_json::Value::Null,
        ),
        ReconcileOutcome::DroppedNoInvoiceRef => {
            ("webhook_dropped", None, serde_json::json!({ "reason": "no invoice reference" }))
        }
        ReconcileOutcome::DroppedUnknownInvoice => {
            ("webhook_dropped", None, serde_json::json!({ "reason": "unknown invoice" }))
        }
        ReconcileOutcome::DroppedUnprocessable(msg) => {
            ("webhook_dropped", None, serde_json::json!({ "reason": msg }))
        }
        ReconcileOutcome::IgnoredEventType(event_type) => {
            ("webhook_ignored", None, serde_json::json!({ "event_type": event_type }))
        }
    };

    record_activity(
        services,
        None,
        Some(headers),
        action,
        "payments",
        "payment webhook delivery",
        target,
        details,
    );
}
