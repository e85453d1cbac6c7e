//! Webhook-driven payment reconciliation.
//!
//! Turns an authenticated gateway event into an idempotent invoice state
//! transition plus a best-effort stock decrement. The contract with the
//! gateway: only signature failures and store failures produce a
//! non-2xx acknowledgment (so it retries); everything the retry cannot
//! fix — missing metadata, unknown invoices, settled invoices, unhandled
//! event types, stock-sync failures — is logged and acknowledged.

use chrono::Utc;

use billflow_billing::{
    BeginStockSync, ConfirmPayment, FinishStockSync, InvoiceCommand, InvoiceId, PaymentMethod,
    RecordPaymentFailure, StockUpdateStatus,
};
use billflow_core::AggregateId;
use billflow_infra::DispatchError;
use billflow_payments::GatewayEvent;
use billflow_stock::{SyncReport, sync_invoice_lines};

use super::services::AppServices;

/// What happened to an acknowledged event (logged and audited; the
/// gateway only ever sees 200).
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Payment recorded; stock outcome attached when a sync ran.
    Processed {
        invoice_id: InvoiceId,
        stock: Option<StockUpdateStatus>,
    },
    /// Payment-failure bookkeeping recorded.
    FailureRecorded { invoice_id: InvoiceId },
    /// No invoice id extractable from event metadata.
    DroppedNoInvoiceRef,
    /// Metadata referenced an invoice we do not have.
    DroppedUnknownInvoice,
    /// The invoice cannot take this payment (e.g. cancelled).
    DroppedUnprocessable(String),
    /// Event type outside the handled set.
    IgnoredEventType(String),
}

/// Process a verified gateway event.
///
/// Errors returned here are store/dispatch failures the gateway should
/// retry; every domain-level dead end maps to an `Ok` outcome.
pub async fn process_gateway_event(
    services: &AppServices,
    event: GatewayEvent,
) -> Result<ReconcileOutcome, DispatchError> {
    match event {
        GatewayEvent::CheckoutSessionCompleted {
            invoice_ref,
            payment_id,
            ..
        } => confirm_and_sync(services, invoice_ref, payment_id).await,
        GatewayEvent::PaymentSucceeded {
            invoice_ref,
            payment_id,
        } => confirm_and_sync(services, invoice_ref, Some(payment_id)).await,
        GatewayEvent::PaymentFailed { invoice_ref, .. } => {
            record_failure(services, invoice_ref).await
        }
        GatewayEvent::Unknown { event_type } => {
            tracing::info!(%event_type, "ignoring unhandled gateway event type");
            Ok(ReconcileOutcome::IgnoredEventType(event_type))
        }
    }
}

async fn confirm_and_sync(
    services: &AppServices,
    invoice_ref: Option<String>,
    gateway_payment_id: Option<String>,
) -> Result<ReconcileOutcome, DispatchError> {
    let Some(aggregate_id) = parse_invoice_ref(invoice_ref.as_deref()) else {
        return Ok(ReconcileOutcome::DroppedNoInvoiceRef);
    };
    let invoice_id = InvoiceId::new(aggregate_id);

    // Idempotent status transition: replays emit nothing.
    let confirm = InvoiceCommand::ConfirmPayment(ConfirmPayment {
        invoice_id,
        method: PaymentMethod::Stripe,
        gateway_payment_id,
        occurred_at: Utc::now(),
    });
    match services.dispatch_invoice(aggregate_id, confirm).await {
        Ok(_) => {}
        Err(DispatchError::NotFound) => {
            tracing::warn!(%invoice_id, "payment event for unknown invoice");
            return Ok(ReconcileOutcome::DroppedUnknownInvoice);
        }
        Err(DispatchError::InvariantViolation(msg)) => {
            tracing::warn!(%invoice_id, %msg, "payment event not applicable");
            return Ok(ReconcileOutcome::DroppedUnprocessable(msg));
        }
        Err(e) => return Err(e),
    }

    // Best-effort stock decrement; nothing from here on fails the ack.
    let stock = match run_stock_sync(services, aggregate_id).await {
        Ok(Some(report)) => Some(report.outcome),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(%invoice_id, "stock sync not started: {e:?}");
            None
        }
    };

    Ok(ReconcileOutcome::Processed { invoice_id, stock })
}

async fn record_failure(
    services: &AppServices,
    invoice_ref: Option<String>,
) -> Result<ReconcileOutcome, DispatchError> {
    let Some(aggregate_id) = parse_invoice_ref(invoice_ref.as_deref()) else {
        return Ok(ReconcileOutcome::DroppedNoInvoiceRef);
    };
    let invoice_id = InvoiceId::new(aggregate_id);

    let cmd = InvoiceCommand::RecordPaymentFailure(RecordPaymentFailure {
        invoice_id,
        method: PaymentMethod::Stripe,
        occurred_at: Utc::now(),
    });
    match services.dispatch_invoice(aggregate_id, cmd).await {
        Ok(_) => Ok(ReconcileOutcome::FailureRecorded { invoice_id }),
        Err(DispatchError::NotFound) => {
            tracing::warn!(%invoice_id, "payment-failure event for unknown invoice");
            Ok(ReconcileOutcome::DroppedUnknownInvoice)
        }
        Err(e) => Err(e),
    }
}

/// Claim the stock-sync slot for a paid invoice, run the decrement, and
/// record the outcome.
///
/// `Ok(None)` means the slot was not claimable — a sync is already
/// completed or another delivery holds it — which is the skip path, not a
/// failure. The conditional claim plus the store's optimistic append is
/// what prevents a concurrent duplicate delivery from decrementing twice.
pub async fn run_stock_sync(
    services: &AppServices,
    aggregate_id: AggregateId,
) -> Result<Option<SyncReport>, DispatchError> {
    let invoice_id = InvoiceId::new(aggregate_id);

    let begin = InvoiceCommand::BeginStockSync(BeginStockSync {
        invoice_id,
        occurred_at: Utc::now(),
    });
    match services.dispatch_invoice(aggregate_id, begin).await {
        Ok(_) => {}
        Err(DispatchError::Concurrency(msg)) => {
            tracing::info!(%invoice_id, %msg, "stock sync skipped");
            return Ok(None);
        }
        Err(e) => return Err(e),
    }

    let invoice = services
        .load_invoice(aggregate_id)
        .await?
        .ok_or(DispatchError::NotFound)?;

    let report = sync_invoice_lines(services.stock_gateway.as_ref(), invoice.lines()).await;

    let finish = InvoiceCommand::FinishStockSync(FinishStockSync {
        invoice_id,
        outcome: report.outcome,
        items: report.items.clone(),
        occurred_at: Utc::now(),
    });
    if let Err(e) = services.dispatch_invoice(aggregate_id, finish).await {
        // The slot stays pending; a later replay cannot reclaim it, so
        // this is loud.
        tracing::error!(%invoice_id, "failed to record stock sync outcome: {e:?}");
    }

    Ok(Some(report))
}

fn parse_invoice_ref(invoice_ref: Option<&str>) -> Option<AggregateId> {
    let raw = invoice_ref?;
    match raw.parse::<AggregateId>() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(invoice_ref = raw, "event metadata carries an unparseable invoice id");
            None
        }
    }
}
