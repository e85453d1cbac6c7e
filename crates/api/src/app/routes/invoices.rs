use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};

use billflow_auth::StaffRole;
use billflow_billing::{
    Cancel, CreateDraft, InvoiceCommand, InvoiceId, MarkAwaitingFunds, PaymentMethod, PublicToken,
    SendEmail, UpdateDraft,
};
use billflow_core::AggregateId;
use billflow_infra::mailer::OutboundEmail;

use crate::app::routes::checkout;
use crate::app::routes::common::record_activity;
use crate::app::routes::stock;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_invoice).get(list_invoices))
        .route("/:id", get(get_invoice).patch(update_invoice))
        .route("/:id/cancel", post(cancel_invoice))
        .route("/:id/email", post(send_invoice_email))
        .route("/:id/awaiting-funds", post(mark_awaiting_funds))
        .route(
            "/:id/checkout-session",
            post(checkout::create_checkout_session),
        )
        .route("/:id/stock-sync", post(stock::sync_invoice_stock))
}

pub(super) fn parse_invoice_id(id: &str) -> Result<AggregateId, axum::response::Response> {
    id.parse::<AggregateId>().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid invoice id")
    })
}

fn parse_due_date(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, axum::response::Response> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_due_date",
                    "due_date must be RFC3339",
                )
            }),
    }
}

pub async fn create_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Json(body): Json<dto::CreateInvoiceRequest>,
) -> axum::response::Response {
    let due_date = match parse_due_date(body.due_date.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let agg = AggregateId::new();
    let invoice_id = InvoiceId::new(agg);
    let invoice_number = body.invoice_number.clone();

    let cmd = InvoiceCommand::CreateDraft(CreateDraft {
        invoice_id,
        invoice_number: body.invoice_number,
        owner: principal.user_id(),
        customer: body.customer.into_details(),
        lines: dto::to_lines(body.lines),
        due_date,
        occurred_at: Utc::now(),
    });

    if let Err(e) = services.dispatch_invoice(agg, cmd).await {
        return errors::dispatch_error_to_response(e);
    }

    record_activity(
        &services,
        Some(principal.user_id()),
        Some(&headers),
        "invoice_created",
        "billing",
        format!("draft invoice {invoice_number} created"),
        Some(invoice_id.to_string()),
        serde_json::Value::Null,
    );

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": invoice_id.to_string(),
            "invoice_number": invoice_number,
        })),
    )
        .into_response()
}

pub async fn list_invoices(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let mut items = services.invoices().list();
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let items = items.iter().map(dto::invoice_to_json).collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.invoices().get(&InvoiceId::new(agg)) {
        Some(rm) => (StatusCode::OK, Json(dto::invoice_to_json(&rm))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "invoice not found"),
    }
}

pub async fn update_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateInvoiceRequest>,
) -> axum::response::Response {
    let agg = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let due_date = match parse_due_date(body.due_date.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let cmd = InvoiceCommand::UpdateDraft(UpdateDraft {
        invoice_id: InvoiceId::new(agg),
        customer: body.customer.map(|c| c.into_details()),
        lines: body.lines.map(dto::to_lines),
        due_date,
        occurred_at: Utc::now(),
    });

    match services.dispatch_invoice(agg, cmd).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "id": agg.to_string() })),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn cancel_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let cmd = InvoiceCommand::Cancel(Cancel {
        invoice_id: InvoiceId::new(agg),
        occurred_at: Utc::now(),
    });

    match services.dispatch_invoice(agg, cmd).await {
        Ok(_) => {
            record_activity(
                &services,
                Some(principal.user_id()),
                Some(&headers),
                "invoice_cancelled",
                "billing",
                "invoice cancelled",
                Some(agg.to_string()),
                serde_json::Value::Null,
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({ "success": true })),
            )
                .into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn mark_awaiting_funds(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::MarkAwaitingFundsRequest>,
) -> axum::response::Response {
    let agg = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let method = match body.method.as_str() {
        "bank_transfer" => PaymentMethod::BankTransfer,
        "cash" => PaymentMethod::Cash,
        _ => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "method must be bank_transfer or cash",
            );
        }
    };

    let cmd = InvoiceCommand::MarkAwaitingFunds(MarkAwaitingFunds {
        invoice_id: InvoiceId::new(agg),
        method,
        occurred_at: Utc::now(),
    });

    match services.dispatch_invoice(agg, cmd).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true })),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Send (or resend) the invoice email. Validates ownership and that the
/// requested recipient matches the stored customer email, then enforces
/// the per-invoice cooldown before anything leaves the building.
pub async fn send_invoice_email(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<dto::SendInvoiceEmailRequest>,
) -> axum::response::Response {
    let agg = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let invoice = match services.load_invoice(agg).await {
        Ok(Some(invoice)) => invoice,
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", "invoice not found");
        }
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    let owns = invoice.owner() == Some(principal.user_id());
    if !owns && principal.role() == StaffRole::Employee {
        return errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "only the invoice owner can send it",
        );
    }

    let customer_email = invoice
        .customer()
        .map(|c| c.email.clone())
        .unwrap_or_default();
    if !body
        .recipient_email
        .trim()
        .eq_ignore_ascii_case(&customer_email)
    {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "recipient does not match the invoice's customer email",
        );
    }

    let token = invoice
        .public_token()
        .cloned()
        .unwrap_or_else(PublicToken::generate);

    let cmd = InvoiceCommand::SendEmail(SendEmail {
        invoice_id: invoice.id_typed(),
        token: token.clone(),
        cooldown_secs: services.config.email_cooldown_secs,
        occurred_at: Utc::now(),
    });
    if let Err(e) = services.dispatch_invoice(agg, cmd).await {
        return errors::dispatch_error_to_response(e);
    }

    let public_url = format!(
        "{}/public/invoices/{token}",
        services.config.public_base_url.trim_end_matches('/')
    );
    let total = invoice.total();
    let email = OutboundEmail {
        to: customer_email,
        subject: format!("Invoice {}", invoice.invoice_number()),
        body: format!(
            "Invoice {} over EUR {}.{:02} is ready.\nView and pay it here: {public_url}",
            invoice.invoice_number(),
            total / 100,
            total % 100,
        ),
    };
    if let Err(e) = services.mailer.send(&email).await {
        tracing::error!(invoice_id = %invoice.id_typed(), "invoice email delivery failed: {e}");
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "dependency_error",
            format!("email provider failed: {e}"),
        );
    }

    record_activity(
        &services,
        Some(principal.user_id()),
        Some(&headers),
        "invoice_email_sent",
        "billing",
        format!("invoice {} emailed", invoice.invoice_number()),
        Some(invoice.id_typed().to_string()),
        serde_json::json!({ "recipient": email.to }),
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}
