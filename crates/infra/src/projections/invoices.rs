use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use billflow_billing::{
    CustomerDetails, InvoiceEvent, InvoiceId, InvoiceLine, InvoiceStatus, PaymentMethod,
    PublicToken, StockUpdateStatus,
};
use billflow_core::{AggregateId, UserId};
use billflow_events::EventEnvelope;

use crate::read_model::KeyedStore;

pub const AGGREGATE_TYPE: &str = "billing.invoice";

/// Queryable invoice read model (header + lines), mirroring the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceReadModel {
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub owner: UserId,
    pub customer: CustomerDetails,
    pub lines: Vec<InvoiceLine>,
    pub status: InvoiceStatus,
    pub total: u64,
    pub created_at: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_date: Option<DateTime<Utc>>,
    pub public_token: Option<PublicToken>,
    pub payment_method: PaymentMethod,
    pub checkout_session_id: Option<String>,
    pub checkout_session_url: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub stock_update_status: StockUpdateStatus,
    pub stock_updated_at: Option<DateTime<Utc>>,
    pub last_email_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("event for unknown read model (aggregate {0})")]
    MissingReadModel(AggregateId),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Builds [`InvoiceReadModel`]s from the invoice event stream.
#[derive(Debug)]
pub struct InvoicesProjection<S>
where
    S: KeyedStore<InvoiceId, InvoiceReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> InvoicesProjection<S>
where
    S: KeyedStore<InvoiceId, InvoiceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, invoice_id: &InvoiceId) -> Option<InvoiceReadModel> {
        self.store.get(invoice_id)
    }

    pub fn list(&self) -> Vec<InvoiceReadModel> {
        self.store.list()
    }

    /// Resolve an invoice by its public token (unauthenticated access path).
    pub fn find_by_token(&self, token: &str) -> Option<InvoiceReadModel> {
        self.store
            .list()
            .into_iter()
            .find(|rm| rm.public_token.as_ref().is_some_and(|t| t.as_str() == token))
    }

    /// Sent/pending invoices whose due date lies strictly before `cutoff` —
    /// the overdue sweep's candidate set.
    pub fn overdue_candidates(&self, cutoff: DateTime<Utc>) -> Vec<InvoiceReadModel> {
        self.store
            .list()
            .into_iter()
            .filter(|rm| {
                matches!(rm.status, InvoiceStatus::Sent | InvoiceStatus::Pending)
                    && rm.due_date.is_some_and(|due| due < cutoff)
            })
            .collect()
    }

    fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => cursors.get(&aggregate_id).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn set_cursor(&self, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, seq);
        }
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let last = self.cursor(aggregate_id);

        // At-least-once bus: drop duplicates, reject gaps.
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let ev: InvoiceEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        self.apply_event(aggregate_id, &ev)?;
        self.set_cursor(aggregate_id, seq);
        Ok(())
    }

    fn apply_event(
        &self,
        aggregate_id: AggregateId,
        ev: &InvoiceEvent,
    ) -> Result<(), ProjectionError> {
        if let InvoiceEvent::DraftCreated(e) = ev {
            self.store.upsert(
                e.invoice_id,
                InvoiceReadModel {
                    invoice_id: e.invoice_id,
                    invoice_number: e.invoice_number.clone(),
                    owner: e.owner,
                    customer: e.customer.clone(),
                    lines: e.lines.clone(),
                    status: InvoiceStatus::Draft,
                    total: e.total,
                    created_at: e.occurred_at,
                    due_date: e.due_date,
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
                },
            );
            return Ok(());
        }

        let invoice_id = InvoiceId::new(aggregate_id);
        let mut rm = self
            .store
            .get(&invoice_id)
            .ok_or(ProjectionError::MissingReadModel(aggregate_id))?;

        match ev {
            InvoiceEvent::DraftCreated(_) => unreachable!("handled above"),
            InvoiceEvent::DraftUpdated(e) => {
                if let Some(customer) = &e.customer {
                    rm.customer = customer.clone();
                }
                if let Some(lines) = &e.lines {
                    rm.lines = lines.clone();
                }
                if e.due_date.is_some() {
                    rm.due_date = e.due_date;
                }
                rm.total = e.total;
            }
            InvoiceEvent::PublicTokenIssued(e) => {
                if rm.public_token.is_none() {
                    rm.public_token = Some(e.token.clone());
                }
            }
            InvoiceEvent::Sent(e) => {
                rm.status = InvoiceStatus::Sent;
                rm.sent_at = Some(e.occurred_at);
                rm.last_email_sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::EmailResent(e) => {
                rm.last_email_sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::MarkedAwaitingFunds(e) => {
                rm.status = InvoiceStatus::Pending;
                rm.payment_method = e.method;
            }
            InvoiceEvent::MarkedOverdue(_) => {
                rm.status = InvoiceStatus::Overdue;
            }
            InvoiceEvent::PaymentConfirmed(e) => {
                rm.status = InvoiceStatus::Paid;
                rm.paid_date = Some(e.occurred_at);
                rm.payment_method = e.method;
                if e.gateway_payment_id.is_some() {
                    rm.gateway_payment_id = e.gateway_payment_id.clone();
                }
            }
            InvoiceEvent::PaymentFailureRecorded(e) => {
                rm.payment_method = e.method;
            }
            InvoiceEvent::PaymentLinkAttached(e) => {
                rm.checkout_session_id = Some(e.session_id.clone());
                rm.checkout_session_url = Some(e.session_url.clone());
            }
            InvoiceEvent::StockSyncStarted(_) => {
                rm.stock_update_status = StockUpdateStatus::Pending;
            }
            InvoiceEvent::StockSyncFinished(e) => {
                rm.stock_update_status = e.status;
                if e.status != StockUpdateStatus::Failed {
                    rm.stock_updated_at = Some(e.occurred_at);
                }
            }
            InvoiceEvent::Cancelled(_) => {
                rm.status = InvoiceStatus::Cancelled;
            }
        }

        self.store.upsert(invoice_id, rm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    use billflow_billing::{DraftCreated, MarkedOverdue, PaymentConfirmed, Sent};
    use billflow_events::Event;

    use crate::read_model::InMemoryKeyedStore;

    fn projection() -> InvoicesProjection<Arc<InMemoryKeyedStore<InvoiceId, InvoiceReadModel>>> {
        InvoicesProjection::new(Arc::new(InMemoryKeyedStore::new()))
    }

    fn envelope(aggregate_id: AggregateId, seq: u64, ev: &InvoiceEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            aggregate_id,
            AGGREGATE_TYPE,
            seq,
            ev.occurred_at(),
            serde_json::to_value(ev).unwrap(),
        )
    }

    fn draft_event(invoice_id: InvoiceId) -> InvoiceEvent {
        InvoiceEvent::DraftCreated(DraftCreated {
            invoice_id,
            invoice_number: "INV-9".to_string(),
            owner: UserId::new(),
            customer: CustomerDetails {
                name: "Ada GmbH".to_string(),
                email: "billing@ada.example".to_string(),
                phone: None,
                address: None,
            },
            lines: vec![],
            due_date: None,
            total: 0,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn builds_the_read_model_from_the_stream() {
        let projection = projection();
        let agg = AggregateId::new();
        let invoice_id = InvoiceId::new(agg);

        projection
            .apply_envelope(&envelope(agg, 1, &draft_event(invoice_id)))
            .unwrap();
        projection
            .apply_envelope(&envelope(
                agg,
                2,
                &InvoiceEvent::Sent(Sent {
                    invoice_id,
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();
        projection
            .apply_envelope(&envelope(
                agg,
                3,
                &InvoiceEvent::PaymentConfirmed(PaymentConfirmed {
                    invoice_id,
                    method: PaymentMethod::Stripe,
                    gateway_payment_id: Some("pi_7".to_string()),
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();

        let rm = projection.get(&invoice_id).unwrap();
        assert_eq!(rm.status, InvoiceStatus::Paid);
        assert_eq!(rm.payment_method, PaymentMethod::Stripe);
        assert_eq!(rm.gateway_payment_id.as_deref(), Some("pi_7"));
        assert!(rm.paid_date.is_some());
    }

    #[test]
    fn duplicate_deliveries_are_dropped_and_gaps_rejected() {
        let projection = projection();
        let agg = AggregateId::new();
        let invoice_id = InvoiceId::new(agg);

        let draft = envelope(agg, 1, &draft_event(invoice_id));
        projection.apply_envelope(&draft).unwrap();
        // Redelivery of the same envelope is a no-op.
        projection.apply_envelope(&draft).unwrap();
        assert_eq!(projection.get(&invoice_id).unwrap().status, InvoiceStatus::Draft);

        // A gap means lost events: refuse rather than corrupt.
        let gap = envelope(
            agg,
            5,
            &InvoiceEvent::MarkedOverdue(MarkedOverdue {
                invoice_id,
                occurred_at: Utc::now(),
            }),
        );
        assert!(matches!(
            projection.apply_envelope(&gap),
            Err(ProjectionError::NonMonotonicSequence { last: 1, found: 5 })
        ));
    }

    #[test]
    fn foreign_aggregate_types_are_ignored() {
        let projection = projection();
        let agg = AggregateId::new();
        let env = EventEnvelope::new(
            Uuid::now_v7(),
            agg,
            "auth.account",
            1,
            Utc::now(),
            serde_json::json!({"anything": true}),
        );
        projection.apply_envelope(&env).unwrap();
        assert!(projection.list().is_empty());
    }
}
