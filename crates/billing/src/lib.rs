//! `billflow-billing` — invoice lifecycle domain.
//!
//! The invoice aggregate owns the status state machine (draft → sent →
//! pending/overdue → paid/cancelled), line items, payment bookkeeping and
//! the stock-sync status fields updated by the reconciliation pipeline.

pub mod invoice;

pub use invoice::{
    AttachPaymentLink, BeginStockSync, Cancel, Cancelled, ConfirmPayment, CreateDraft,
    CustomerDetails, DraftCreated, DraftUpdated, EmailResent, FinishStockSync, Invoice,
    InvoiceCommand, InvoiceEvent, InvoiceId, InvoiceLine, InvoiceStatus, MarkAwaitingFunds,
    MarkOverdue, MarkedAwaitingFunds, MarkedOverdue, PaymentConfirmed, PaymentFailureRecorded,
    PaymentLinkAttached, PaymentMethod, PublicToken, PublicTokenIssued, RecordPaymentFailure,
    SendEmail, Sent, StockLineResult, StockSyncFinished, StockSyncStarted, StockUpdateStatus,
    UpdateDraft, validate_lines,
};
