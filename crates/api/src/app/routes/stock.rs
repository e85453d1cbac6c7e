use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use billflow_billing::{Invoice, InvoiceStatus, StockLineResult, StockUpdateStatus};

use crate::app::reconcile::run_stock_sync;
use crate::app::routes::common::record_activity;
use crate::app::routes::invoices::parse_invoice_id;
use crate::app::services::AppServices;
use crate::app::errors;
use crate::context::PrincipalContext;

/// Manually (re)run the remote stock decrement for a paid invoice.
///
/// 200 when every attempted item succeeded, 207 on a partial pass, 500
/// when nothing succeeded.
pub async fn sync_invoice_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
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

    if invoice.status() != InvoiceStatus::Paid {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invariant_violation",
            "stock sync requires a paid invoice",
        );
    }

    match invoice.stock_update_status() {
        StockUpdateStatus::Completed => {
            return (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "message": "stock already synchronized",
                    "updated_items": 0,
                    "details": [],
                })),
            )
                .into_response();
        }
        StockUpdateStatus::Pending => {
            return errors::json_error(
                StatusCode::CONFLICT,
                "conflict",
                "stock sync already in progress",
            );
        }
        _ => {}
    }

    let report = match run_stock_sync(&services, agg).await {
        Ok(Some(report)) => report,
        // Lost the slot to a concurrent webhook delivery.
        Ok(None) => {
            return errors::json_error(
                StatusCode::CONFLICT,
                "conflict",
                "stock sync already in progress",
            );
        }
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    record_activity(
        &services,
        Some(principal.user_id()),
        Some(&headers),
        "stock_sync_run",
        "stock",
        format!("stock sync for invoice {}", invoice.invoice_number()),
        Some(invoice.id_typed().to_string()),
        serde_json::json!({ "outcome": report.outcome.as_str() }),
    );

    let status = match report.outcome {
        StockUpdateStatus::Completed => StatusCode::OK,
        StockUpdateStatus::Partial => StatusCode::MULTI_STATUS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match report.outcome {
        StockUpdateStatus::Completed => "stock synchronized",
        StockUpdateStatus::Partial => "stock partially synchronized",
        _ => "stock synchronization failed",
    };

    (
        status,
        Json(serde_json::json!({
            "success": report.outcome == StockUpdateStatus::Completed,
            "message": message,
            "updated_items": report.updated_items,
            "details": report
                .items
                .iter()
                .map(|item| item_to_json(&invoice, item))
                .collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

fn item_to_json(invoice: &Invoice, item: &StockLineResult) -> serde_json::Value {
    let product_name = invoice
        .lines()
        .iter()
        .find(|l| l.product_ref.as_deref() == Some(item.product_ref.as_str()))
        .map(|l| l.description.clone());

    serde_json::json!({
        "product_id": item.product_ref,
        "product_name": product_name,
        "quantity": item.quantity,
        "success": item.success,
        "error": item.error,
    })
}
