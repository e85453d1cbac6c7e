use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use billflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use billflow_events::Event;

/// Invoice identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Invoice status lifecycle.
///
/// `Paid` and `Cancelled` are terminal: no automated transition (sweep,
/// webhook) moves an invoice out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Pending,
    Overdue,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

/// How a payment was (or is expected to be) made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Stripe,
    BankTransfer,
    Cash,
    #[default]
    Unknown,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Unknown => "unknown",
        }
    }
}

/// Progress of the remote stock decrement for a paid invoice.
///
/// `Completed` is sticky: once reached, replayed payment events never
/// trigger another sync. `Failed`/`Partial` deliberately are not, so a
/// later webhook replay can retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StockUpdateStatus {
    #[default]
    None,
    Pending,
    Completed,
    Failed,
    Partial,
}

impl StockUpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StockUpdateStatus::None => "none",
            StockUpdateStatus::Pending => "pending",
            StockUpdateStatus::Completed => "completed",
            StockUpdateStatus::Failed => "failed",
            StockUpdateStatus::Partial => "partial",
        }
    }
}

/// Opaque, unguessable token granting unauthenticated read/pay access to a
/// single invoice. Generated lazily on first need; immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicToken(String);

impl PublicToken {
    /// Generate a fresh token (122 bits of randomness, hex-encoded).
    ///
    /// Callers generate tokens and pass them inside commands so the
    /// aggregate's decision logic stays deterministic.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PublicToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Billed customer details captured on the invoice header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// A single invoice line.
///
/// `product_ref` optionally points at a product in the external catalog;
/// free-text lines (no reference) are billable but skipped by stock sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub line_no: u32,
    pub product_ref: Option<String>,
    pub description: String,
    pub quantity: i64,
    /// Price in smallest currency unit (EUR cents).
    pub unit_price: u64,
}

impl InvoiceLine {
    /// Line total in minor currency units (checked arithmetic).
    pub fn total(&self) -> Result<u64, DomainError> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(
                "invoice line quantity must be positive",
            ));
        }
        let total = (self.quantity as i128)
            .checked_mul(self.unit_price as i128)
            .ok_or_else(|| DomainError::invariant("invoice line amount overflow"))?;
        u64::try_from(total).map_err(|_| DomainError::invariant("invoice line amount overflow"))
    }
}

/// Validate a set of lines and return their summed total in minor units.
///
/// An empty set is valid at the draft stage; checkout-session creation
/// applies its own stricter rules.
pub fn validate_lines(lines: &[InvoiceLine]) -> Result<u64, DomainError> {
    let mut total: u64 = 0;
    for line in lines {
        if line.description.trim().is_empty() {
            return Err(DomainError::validation(
                "invoice line description cannot be empty",
            ));
        }
        total = total
            .checked_add(line.total()?)
            .ok_or_else(|| DomainError::invariant("invoice total overflow"))?;
    }
    Ok(total)
}

/// Per-line result of one stock-sync pass, recorded for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLineResult {
    pub product_ref: String,
    pub quantity: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    invoice_number: String,
    owner: Option<UserId>,
    customer: Option<CustomerDetails>,
    lines: Vec<InvoiceLine>,
    status: InvoiceStatus,
    total: u64,
    created_at: Option<DateTime<Utc>>,
    due_date: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    paid_date: Option<DateTime<Utc>>,
    public_token: Option<PublicToken>,
    payment_method: PaymentMethod,
    checkout_session_id: Option<String>,
    checkout_session_url: Option<String>,
    gateway_payment_id: Option<String>,
    stock_update_status: StockUpdateStatus,
    stock_updated_at: Option<DateTime<Utc>>,
    last_email_sent_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            invoice_number: String::new(),
            owner: None,
            customer: None,
            lines: Vec::new(),
            status: InvoiceStatus::Draft,
            total: 0,
            created_at: None,
            due_date: None,
            sent_at: None,
            paid_date: None,
            public_token: None,
            payment_method: PaymentMethod::Unknown,
            checkout_session_id: None,
            checkout_session_url: None,
            gateway_payment_id: None,
            stock_update_status: StockUpdateStatus::None,
            stock_updated_at: None,
            last_email_sent_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn owner(&self) -> Option<UserId> {
        self.owner
    }

    pub fn customer(&self) -> Option<&CustomerDetails> {
        self.customer.as_ref()
    }

    pub fn lines(&self) -> &[InvoiceLine] {
        &self.lines
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn paid_date(&self) -> Option<DateTime<Utc>> {
        self.paid_date
    }

    pub fn public_token(&self) -> Option<&PublicToken> {
        self.public_token.as_ref()
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn checkout_session_id(&self) -> Option<&str> {
        self.checkout_session_id.as_deref()
    }

    pub fn checkout_session_url(&self) -> Option<&str> {
        self.checkout_session_url.as_deref()
    }

    pub fn gateway_payment_id(&self) -> Option<&str> {
        self.gateway_payment_id.as_deref()
    }

    pub fn stock_update_status(&self) -> StockUpdateStatus {
        self.stock_update_status
    }

    pub fn stock_updated_at(&self) -> Option<DateTime<Utc>> {
        self.stock_updated_at
    }

    pub fn last_email_sent_at(&self) -> Option<DateTime<Utc>> {
        self.last_email_sent_at
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Command: create a draft invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDraft {
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub owner: UserId,
    pub customer: CustomerDetails,
    pub lines: Vec<InvoiceLine>,
    pub due_date: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: edit an unsettled invoice (allowed while draft/sent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDraft {
    pub invoice_id: InvoiceId,
    pub customer: Option<CustomerDetails>,
    pub lines: Option<Vec<InvoiceLine>>,
    pub due_date: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record an invoice email send.
///
/// `token` is a freshly generated candidate public token, used only when
/// the invoice does not have one yet. `cooldown_secs` is the configured
/// per-invoice resend window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmail {
    pub invoice_id: InvoiceId,
    pub token: PublicToken,
    pub cooldown_secs: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: staff marks a sent invoice as awaiting funds (bank transfer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAwaitingFunds {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub occurred_at: DateTime<Utc>,
}

/// Command: sweep marks the invoice overdue when its due date lies strictly
/// before `cutoff` (= now − configured grace).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOverdue {
    pub invoice_id: InvoiceId,
    pub cutoff: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: the payment gateway confirmed a payment for this invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPayment {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub gateway_payment_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: the gateway reported a failed payment attempt (bookkeeping only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPaymentFailure {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub occurred_at: DateTime<Utc>,
}

/// Command: persist a hosted checkout session's id and URL on the invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachPaymentLink {
    pub invoice_id: InvoiceId,
    pub session_id: String,
    pub session_url: String,
    pub token: PublicToken,
    pub occurred_at: DateTime<Utc>,
}

/// Command: claim the stock-sync slot for a paid invoice.
///
/// Rejected with a conflict when a sync is already pending or completed;
/// together with the store's optimistic append this closes the
/// double-decrement race between concurrent webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginStockSync {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record the outcome of a stock-sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishStockSync {
    pub invoice_id: InvoiceId,
    pub outcome: StockUpdateStatus,
    pub items: Vec<StockLineResult>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: staff cancels an unsettled invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateDraft(CreateDraft),
    UpdateDraft(UpdateDraft),
    SendEmail(SendEmail),
    MarkAwaitingFunds(MarkAwaitingFunds),
    MarkOverdue(MarkOverdue),
    ConfirmPayment(ConfirmPayment),
    RecordPaymentFailure(RecordPaymentFailure),
    AttachPaymentLink(AttachPaymentLink),
    BeginStockSync(BeginStockSync),
    FinishStockSync(FinishStockSync),
    Cancel(Cancel),
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftCreated {
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub owner: UserId,
    pub customer: CustomerDetails,
    pub lines: Vec<InvoiceLine>,
    pub due_date: Option<DateTime<Utc>>,
    pub total: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftUpdated {
    pub invoice_id: InvoiceId,
    pub customer: Option<CustomerDetails>,
    pub lines: Option<Vec<InvoiceLine>>,
    pub due_date: Option<DateTime<Utc>>,
    pub total: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicTokenIssued {
    pub invoice_id: InvoiceId,
    pub token: PublicToken,
    pub occurred_at: DateTime<Utc>,
}

/// First email send: draft → sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sent {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Subsequent email send on an already-sent invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailResent {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedAwaitingFunds {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedOverdue {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmed {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub gateway_payment_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailureRecorded {
    pub invoice_id: InvoiceId,
    pub method: PaymentMethod,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLinkAttached {
    pub invoice_id: InvoiceId,
    pub session_id: String,
    pub session_url: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSyncStarted {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSyncFinished {
    pub invoice_id: InvoiceId,
    pub status: StockUpdateStatus,
    pub items: Vec<StockLineResult>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancelled {
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    DraftCreated(DraftCreated),
    DraftUpdated(DraftUpdated),
    PublicTokenIssued(PublicTokenIssued),
    Sent(Sent),
    EmailResent(EmailResent),
    MarkedAwaitingFunds(MarkedAwaitingFunds),
    MarkedOverdue(MarkedOverdue),
    PaymentConfirmed(PaymentConfirmed),
    PaymentFailureRecorded(PaymentFailureRecorded),
    PaymentLinkAttached(PaymentLinkAttached),
    StockSyncStarted(StockSyncStarted),
    StockSyncFinished(StockSyncFinished),
    Cancelled(Cancelled),
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::DraftCreated(_) => "billing.invoice.draft_created",
            InvoiceEvent::DraftUpdated(_) => "billing.invoice.draft_updated",
            InvoiceEvent::PublicTokenIssued(_) => "billing.invoice.public_token_issued",
            InvoiceEvent::Sent(_) => "billing.invoice.sent",
            InvoiceEvent::EmailResent(_) => "billing.invoice.email_resent",
            InvoiceEvent::MarkedAwaitingFunds(_) => "billing.invoice.marked_awaiting_funds",
            InvoiceEvent::MarkedOverdue(_) => "billing.invoice.marked_overdue",
            InvoiceEvent::PaymentConfirmed(_) => "billing.invoice.payment_confirmed",
            InvoiceEvent::PaymentFailureRecorded(_) => "billing.invoice.payment_failure_recorded",
            InvoiceEvent::PaymentLinkAttached(_) => "billing.invoice.payment_link_attached",
            InvoiceEvent::StockSyncStarted(_) => "billing.invoice.stock_sync_started",
            InvoiceEvent::StockSyncFinished(_) => "billing.invoice.stock_sync_finished",
            InvoiceEvent::Cancelled(_) => "billing.invoice.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::DraftCreated(e) => e.occurred_at,
            InvoiceEvent::DraftUpdated(e) => e.occurred_at,
            InvoiceEvent::PublicTokenIssued(e) => e.occurred_at,
            InvoiceEvent::Sent(e) => e.occurred_at,
            InvoiceEvent::EmailResent(e) => e.occurred_at,
            InvoiceEvent::MarkedAwaitingFunds(e) => e.occurred_at,
            InvoiceEvent::MarkedOverdue(e) => e.occurred_at,
            InvoiceEvent::PaymentConfirmed(e) => e.occurred_at,
            InvoiceEvent::PaymentFailureRecorded(e) => e.occurred_at,
            InvoiceEvent::PaymentLinkAttached(e) => e.occurred_at,
            InvoiceEvent::StockSyncStarted(e) => e.occurred_at,
            InvoiceEvent::StockSyncFinished(e) => e.occurred_at,
            InvoiceEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate implementation
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::DraftCreated(e) => {
                self.id = e.invoice_id;
                self.invoice_number = e.invoice_number.clone();
                self.owner = Some(e.owner);
                self.customer = Some(e.customer.clone());
                self.lines = e.lines.clone();
                self.due_date = e.due_date;
                self.total = e.total;
                self.status = InvoiceStatus::Draft;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            InvoiceEvent::DraftUpdated(e) => {
                if let Some(customer) = &e.customer {
                    self.customer = Some(customer.clone());
                }
                if let Some(lines) = &e.lines {
                    self.lines = lines.clone();
                }
                if e.due_date.is_some() {
                    self.due_date = e.due_date;
                }
                self.total = e.total;
            }
            InvoiceEvent::PublicTokenIssued(e) => {
                // Immutable once set; a second issuance event is ignored.
                if self.public_token.is_none() {
                    self.public_token = Some(e.token.clone());
                }
            }
            InvoiceEvent::Sent(e) => {
                self.status = InvoiceStatus::Sent;
                self.sent_at = Some(e.occurred_at);
                self.last_email_sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::EmailResent(e) => {
                self.last_email_sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::MarkedAwaitingFunds(e) => {
                self.status = InvoiceStatus::Pending;
                self.payment_method = e.method;
            }
            InvoiceEvent::MarkedOverdue(_) => {
                self.status = InvoiceStatus::Overdue;
            }
            InvoiceEvent::PaymentConfirmed(e) => {
                self.status = InvoiceStatus::Paid;
                self.paid_date = Some(e.occurred_at);
                self.payment_method = e.method;
                if e.gateway_payment_id.is_some() {
                    self.gateway_payment_id = e.gateway_payment_id.clone();
                }
            }
            InvoiceEvent::PaymentFailureRecorded(e) => {
                self.payment_method = e.method;
            }
            InvoiceEvent::PaymentLinkAttached(e) => {
                self.checkout_session_id = Some(e.session_id.clone());
                self.checkout_session_url = Some(e.session_url.clone());
            }
            InvoiceEvent::StockSyncStarted(_) => {
                self.stock_update_status = StockUpdateStatus::Pending;
            }
            InvoiceEvent::StockSyncFinished(e) => {
                self.stock_update_status = e.status;
                if e.status != StockUpdateStatus::Failed {
                    self.stock_updated_at = Some(e.occurred_at);
                }
            }
            InvoiceEvent::Cancelled(_) => {
                self.status = InvoiceStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::CreateDraft(cmd) => self.handle_create(cmd),
            InvoiceCommand::UpdateDraft(cmd) => self.handle_update(cmd),
            InvoiceCommand::SendEmail(cmd) => self.handle_send_email(cmd),
            InvoiceCommand::MarkAwaitingFunds(cmd) => self.handle_mark_awaiting_funds(cmd),
            InvoiceCommand::MarkOverdue(cmd) => self.handle_mark_overdue(cmd),
            InvoiceCommand::ConfirmPayment(cmd) => self.handle_confirm_payment(cmd),
            InvoiceCommand::RecordPaymentFailure(cmd) => self.handle_record_payment_failure(cmd),
            InvoiceCommand::AttachPaymentLink(cmd) => self.handle_attach_payment_link(cmd),
            InvoiceCommand::BeginStockSync(cmd) => self.handle_begin_stock_sync(cmd),
            InvoiceCommand::FinishStockSync(cmd) => self.handle_finish_stock_sync(cmd),
            InvoiceCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Invoice {
    fn ensure_invoice_id(&self, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    /// Emit a token issuance event first when the invoice has none yet.
    fn token_events(&self, cmd_token: &PublicToken, occurred_at: DateTime<Utc>) -> Vec<InvoiceEvent> {
        if self.public_token.is_some() {
            return vec![];
        }
        vec![InvoiceEvent::PublicTokenIssued(PublicTokenIssued {
            invoice_id: self.id,
            token: cmd_token.clone(),
            occurred_at,
        })]
    }

    fn handle_create(&self, cmd: &CreateDraft) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }
        if cmd.invoice_number.trim().is_empty() {
            return Err(DomainError::validation("invoice_number cannot be empty"));
        }
        if cmd.customer.name.trim().is_empty() {
            return Err(DomainError::validation("customer name cannot be empty"));
        }
        if cmd.customer.email.trim().is_empty() || !cmd.customer.email.contains('@') {
            return Err(DomainError::validation("invalid customer email"));
        }

        let total = validate_lines(&cmd.lines)?;

        Ok(vec![InvoiceEvent::DraftCreated(DraftCreated {
            invoice_id: cmd.invoice_id,
            invoice_number: cmd.invoice_number.trim().to_string(),
            owner: cmd.owner,
            customer: cmd.customer.clone(),
            lines: cmd.lines.clone(),
            due_date: cmd.due_date,
            total,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateDraft) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if !matches!(self.status, InvoiceStatus::Draft | InvoiceStatus::Sent) {
            return Err(DomainError::invariant(
                "only draft or sent invoices can be edited",
            ));
        }

        if let Some(customer) = &cmd.customer {
            if customer.name.trim().is_empty() {
                return Err(DomainError::validation("customer name cannot be empty"));
            }
            if customer.email.trim().is_empty() || !customer.email.contains('@') {
                return Err(DomainError::validation("invalid customer email"));
            }
        }

        let total = match &cmd.lines {
            Some(lines) => validate_lines(lines)?,
            None => self.total,
        };

        Ok(vec![InvoiceEvent::DraftUpdated(DraftUpdated {
            invoice_id: cmd.invoice_id,
            customer: cmd.customer.clone(),
            lines: cmd.lines.clone(),
            due_date: cmd.due_date,
            total,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_send_email(&self, cmd: &SendEmail) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invariant("cannot email a settled invoice"));
        }

        // Per-invoice cooldown: the rejected call mutates nothing.
        if let Some(last) = self.last_email_sent_at {
            let elapsed = (cmd.occurred_at - last).num_seconds();
            if elapsed < cmd.cooldown_secs {
                return Err(DomainError::rate_limited(cmd.cooldown_secs - elapsed));
            }
        }

        let mut events = self.token_events(&cmd.token, cmd.occurred_at);
        if self.status == InvoiceStatus::Draft {
            events.push(InvoiceEvent::Sent(Sent {
                invoice_id: cmd.invoice_id,
                occurred_at: cmd.occurred_at,
            }));
        } else {
            events.push(InvoiceEvent::EmailResent(EmailResent {
                invoice_id: cmd.invoice_id,
                occurred_at: cmd.occurred_at,
            }));
        }
        Ok(events)
    }

    fn handle_mark_awaiting_funds(
        &self,
        cmd: &MarkAwaitingFunds,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        match self.status {
            // Tolerate a repeated staff action.
            InvoiceStatus::Pending => Ok(vec![]),
            InvoiceStatus::Sent => Ok(vec![InvoiceEvent::MarkedAwaitingFunds(
                MarkedAwaitingFunds {
                    invoice_id: cmd.invoice_id,
                    method: cmd.method,
                    occurred_at: cmd.occurred_at,
                },
            )]),
            _ => Err(DomainError::invariant(
                "only a sent invoice can be marked as awaiting funds",
            )),
        }
    }

    fn handle_mark_overdue(&self, cmd: &MarkOverdue) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        // The sweep is idempotent and race-tolerant: anything that is not a
        // sent/pending invoice past its due date is a no-op, never an error.
        let eligible = matches!(self.status, InvoiceStatus::Sent | InvoiceStatus::Pending);
        let elapsed = self.due_date.is_some_and(|due| due < cmd.cutoff);
        if !eligible || !elapsed {
            return Ok(vec![]);
        }

        Ok(vec![InvoiceEvent::MarkedOverdue(MarkedOverdue {
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm_payment(
        &self,
        cmd: &ConfirmPayment,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        match self.status {
            // Replayed gateway deliveries converge to the same state.
            InvoiceStatus::Paid => Ok(vec![]),
            InvoiceStatus::Cancelled => Err(DomainError::invariant(
                "cannot record a payment on a cancelled invoice",
            )),
            _ => Ok(vec![InvoiceEvent::PaymentConfirmed(PaymentConfirmed {
                invoice_id: cmd.invoice_id,
                method: cmd.method,
                gateway_payment_id: cmd.gateway_payment_id.clone(),
                occurred_at: cmd.occurred_at,
            })]),
        }
    }

    fn handle_record_payment_failure(
        &self,
        cmd: &RecordPaymentFailure,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        Ok(vec![InvoiceEvent::PaymentFailureRecorded(
            PaymentFailureRecorded {
                invoice_id: cmd.invoice_id,
                method: cmd.method,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_attach_payment_link(
        &self,
        cmd: &AttachPaymentLink,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if self.status == InvoiceStatus::Paid {
            return Err(DomainError::invariant("invoice is already paid"));
        }
        if self.status == InvoiceStatus::Cancelled {
            return Err(DomainError::invariant(
                "cannot attach a payment link to a cancelled invoice",
            ));
        }

        let mut events = self.token_events(&cmd.token, cmd.occurred_at);
        events.push(InvoiceEvent::PaymentLinkAttached(PaymentLinkAttached {
            invoice_id: cmd.invoice_id,
            session_id: cmd.session_id.clone(),
            session_url: cmd.session_url.clone(),
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    fn handle_begin_stock_sync(
        &self,
        cmd: &BeginStockSync,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if self.status != InvoiceStatus::Paid {
            return Err(DomainError::invariant(
                "stock sync requires a paid invoice",
            ));
        }
        match self.stock_update_status {
            StockUpdateStatus::Pending => {
                Err(DomainError::conflict("stock sync already in progress"))
            }
            StockUpdateStatus::Completed => {
                Err(DomainError::conflict("stock sync already completed"))
            }
            // None, Failed and Partial may (re)claim the slot.
            _ => Ok(vec![InvoiceEvent::StockSyncStarted(StockSyncStarted {
                invoice_id: cmd.invoice_id,
                occurred_at: cmd.occurred_at,
            })]),
        }
    }

    fn handle_finish_stock_sync(
        &self,
        cmd: &FinishStockSync,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if self.stock_update_status != StockUpdateStatus::Pending {
            return Err(DomainError::conflict("no stock sync in progress"));
        }
        if !matches!(
            cmd.outcome,
            StockUpdateStatus::Completed | StockUpdateStatus::Failed | StockUpdateStatus::Partial
        ) {
            return Err(DomainError::validation(
                "stock sync outcome must be completed, failed or partial",
            ));
        }

        Ok(vec![InvoiceEvent::StockSyncFinished(StockSyncFinished {
            invoice_id: cmd.invoice_id,
            status: cmd.outcome,
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::conflict("invoice is already settled"));
        }

        Ok(vec![InvoiceEvent::Cancelled(Cancelled {
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
