use serde::Deserialize;

use billflow_billing::{CustomerDetails, InvoiceLine};
use billflow_infra::projections::InvoiceReadModel;
use billflow_infra::projections::StaffReadModel;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CustomerRequest {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl CustomerRequest {
    pub fn into_details(self) -> CustomerDetails {
        CustomerDetails {
            name: self.name,
            email: self.email,
            phone: self.phone,
            address: self.address,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InvoiceLineRequest {
    pub product_ref: Option<String>,
    pub description: String,
    pub quantity: i64,
    pub unit_price: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub invoice_number: String,
    pub customer: CustomerRequest,
    #[serde(default)]
    pub lines: Vec<InvoiceLineRequest>,
    /// RFC3339 timestamp.
    pub due_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInvoiceRequest {
    pub customer: Option<CustomerRequest>,
    pub lines: Option<Vec<InvoiceLineRequest>>,
    /// RFC3339 timestamp.
    pub due_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendInvoiceEmailRequest {
    /// Must match the customer email stored on the invoice.
    pub recipient_email: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkAwaitingFundsRequest {
    /// "bank_transfer" or "cash".
    pub method: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
    /// "super_admin", "admin" or "employee".
    pub role: String,
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn to_lines(req_lines: Vec<InvoiceLineRequest>) -> Vec<InvoiceLine> {
    req_lines
        .into_iter()
        .enumerate()
        .map(|(idx, l)| InvoiceLine {
            line_no: (idx as u32) + 1,
            product_ref: l.product_ref,
            description: l.description,
            quantity: l.quantity,
            unit_price: l.unit_price,
        })
        .collect()
}

pub fn invoice_to_json(rm: &InvoiceReadModel) -> serde_json::Value {
    serde_json::json!({
        "id": rm.invoice_id.to_string(),
        "invoice_number": rm.invoice_number,
        "owner_user_id": rm.owner.to_string(),
        "customer": {
            "name": rm.customer.name,
            "email": rm.customer.email,
            "phone": rm.customer.phone,
            "address": rm.customer.address,
        },
        "status": rm.status.as_str(),
        "total": rm.total,
        "created_at": rm.created_at.to_rfc3339(),
        "due_date": rm.due_date.map(|d| d.to_rfc3339()),
        "sent_at": rm.sent_at.map(|d| d.to_rfc3339()),
        "paid_date": rm.paid_date.map(|d| d.to_rfc3339()),
        "payment_method": rm.payment_method.as_str(),
        "payment_url": rm.checkout_session_url,
        "payment_link_id": rm.checkout_session_id,
        "stock_update_status": rm.stock_update_status.as_str(),
        "stock_updated_at": rm.stock_updated_at.map(|d| d.to_rfc3339()),
        "last_invoice_email_sent": rm.last_email_sent_at.map(|d| d.to_rfc3339()),
        "lines": rm.lines.iter().map(line_to_json).collect::<Vec<_>>(),
    })
}

/// Reduced view for the unauthenticated public invoice page: no owner,
/// no bookkeeping fields, and a `payment_url` that may be absent (the
/// page then renders view-only).
pub fn public_invoice_to_json(rm: &InvoiceReadModel) -> serde_json::Value {
    serde_json::json!({
        "invoice_number": rm.invoice_number,
        "customer_name": rm.customer.name,
        "status": rm.status.as_str(),
        "total": rm.total,
        "due_date": rm.due_date.map(|d| d.to_rfc3339()),
        "payment_url": rm.checkout_session_url,
        "lines": rm.lines.iter().map(line_to_json).collect::<Vec<_>>(),
    })
}

fn line_to_json(line: &InvoiceLine) -> serde_json::Value {
    serde_json::json!({
        "line_no": line.line_no,
        "product_ref": line.product_ref,
        "description": line.description,
        "quantity": line.quantity,
        "unit_price": line.unit_price,
        "total": line.quantity as u64 * line.unit_price,
    })
}

pub fn staff_to_json(rm: &StaffReadModel) -> serde_json::Value {
    serde_json::json!({
        "id": rm.user_id.to_string(),
        "email": rm.email,
        "display_name": rm.display_name,
        "role": rm.role.as_str(),
        "active": rm.active,
        "created_at": rm.created_at.to_rfc3339(),
    })
}
