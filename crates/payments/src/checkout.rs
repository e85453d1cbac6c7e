//! Hosted checkout-session building.
//!
//! [`build_session_spec`] validates an invoice and mirrors its line items
//! into a gateway session request; [`CheckoutGateway`] is the seam the
//! HTTP client in infra implements.

use async_trait::async_trait;
use thiserror::Error;

use billflow_billing::{Invoice, PublicToken};
use billflow_core::DomainError;

/// Currency is fixed for the whole store.
pub const CURRENCY: &str = "eur";

/// A validated, gateway-agnostic checkout session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionSpec {
    /// Invoice identifier, carried into session metadata for reconciliation.
    pub invoice_ref: String,
    pub currency: &'static str,
    pub customer_email: String,
    pub line_items: Vec<SessionLineItem>,
    pub success_url: String,
    pub cancel_url: String,
}

/// One hosted-checkout line item, amounts in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLineItem {
    pub name: String,
    pub quantity: i64,
    pub unit_amount: u64,
}

/// A created hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway credential is absent or unusable.
    #[error("payment gateway is not configured: {0}")]
    Configuration(String),

    /// The request never produced a usable response (network, timeout).
    #[error("payment gateway request failed: {0}")]
    Request(String),

    /// The gateway answered, but not with what we expect.
    #[error("unexpected payment gateway response: {0}")]
    Response(String),
}

/// Creates hosted checkout sessions. Implemented over HTTP in infra and by
/// a recording fake in tests.
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_session(
        &self,
        spec: &CheckoutSessionSpec,
    ) -> Result<CheckoutSession, GatewayError>;
}

/// Validate `invoice` and build the session request.
///
/// Quantities and prices are already typed (positive / minor units), so the
/// checks left here are the ones the type system cannot carry: at least one
/// line, and a name on every line. The success/cancel URLs point back at
/// the public invoice view with a query flag.
pub fn build_session_spec(
    invoice: &Invoice,
    token: &PublicToken,
    public_base_url: &str,
) -> Result<CheckoutSessionSpec, DomainError> {
    if invoice.lines().is_empty() {
        return Err(DomainError::validation(
            "cannot create a checkout session for an invoice without line items",
        ));
    }

    let customer = invoice
        .customer()
        .ok_or_else(|| DomainError::validation("invoice has no customer details"))?;

    let mut line_items = Vec::with_capacity(invoice.lines().len());
    for line in invoice.lines() {
        if line.description.trim().is_empty() {
            return Err(DomainError::validation(
                "invoice line is missing a product name",
            ));
        }
        if line.quantity <= 0 {
            return Err(DomainError::validation(
                "invoice line quantity must be positive",
            ));
        }
        line_items.push(SessionLineItem {
            name: line.description.clone(),
            quantity: line.quantity,
            unit_amount: line.unit_price,
        });
    }

    let base = public_base_url.trim_end_matches('/');
    Ok(CheckoutSessionSpec {
        invoice_ref: invoice.id_typed().to_string(),
        currency: CURRENCY,
        customer_email: customer.email.clone(),
        line_items,
        success_url: format!("{base}/public/invoices/{token}?payment=success"),
        cancel_url: format!("{base}/public/invoices/{token}?payment=cancelled"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use billflow_billing::{
        CreateDraft, CustomerDetails, Invoice, InvoiceCommand, InvoiceId, InvoiceLine,
    };
    use billflow_core::{Aggregate, AggregateId, UserId};
    use chrono::Utc;

    fn invoice_with_lines(lines: Vec<InvoiceLine>) -> Invoice {
        let id = InvoiceId::new(AggregateId::new());
        let mut invoice = Invoice::empty(id);
        let events = invoice
            .handle(&InvoiceCommand::CreateDraft(CreateDraft {
                invoice_id: id,
                invoice_number: "INV-7".to_string(),
                owner: UserId::new(),
                customer: CustomerDetails {
                    name: "Ada GmbH".to_string(),
                    email: "billing@ada.example".to_string(),
                    phone: None,
                    address: None,
                },
                lines,
                due_date: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            invoice.apply(e);
        }
        invoice
    }

    fn line(no: u32, qty: i64, price: u64) -> InvoiceLine {
        InvoiceLine {
            line_no: no,
            product_ref: None,
            description: format!("item {no}"),
            quantity: qty,
            unit_price: price,
        }
    }

    #[test]
    fn session_amounts_round_trip_to_the_invoice_total() {
        let invoice = invoice_with_lines(vec![line(1, 2, 1000), line(2, 1, 500), line(3, 4, 99)]);
        let token = PublicToken::new("tok");

        let spec = build_session_spec(&invoice, &token, "https://billflow.example").unwrap();

        let session_total: u64 = spec
            .line_items
            .iter()
            .map(|l| l.quantity as u64 * l.unit_amount)
            .sum();
        assert_eq!(session_total, invoice.total());
        assert_eq!(spec.currency, "eur");
        assert_eq!(spec.customer_email, "billing@ada.example");
        assert_eq!(spec.invoice_ref, invoice.id_typed().to_string());
    }

    #[test]
    fn redirect_urls_target_the_public_view_with_a_flag() {
        let invoice = invoice_with_lines(vec![line(1, 1, 100)]);
        let token = PublicToken::new("tok123");

        let spec = build_session_spec(&invoice, &token, "https://billflow.example/").unwrap();

        assert_eq!(
            spec.success_url,
            "https://billflow.example/public/invoices/tok123?payment=success"
        );
        assert_eq!(
            spec.cancel_url,
            "https://billflow.example/public/invoices/tok123?payment=cancelled"
        );
    }

    #[test]
    fn an_empty_invoice_never_creates_an_empty_session() {
        let invoice = invoice_with_lines(vec![]);
        let err = build_session_spec(&invoice, &PublicToken::new("t"), "https://x.example")
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
