//! Command execution pipeline.
//!
//! One consistent lifecycle for every aggregate:
//!
//! ```text
//! load stream → validate → rehydrate → handle command → append (optimistic) → publish
//! ```
//!
//! Events are persisted before publication; a publish failure after a
//! successful append surfaces as `DispatchError::Publish` and a retry may
//! duplicate deliveries (consumers are idempotent). Appends carry
//! `ExpectedVersion::Exact(stream version)`, so two concurrent dispatches
//! against the same aggregate cannot both commit — the conditional-update
//! guarantee the reconciliation path relies on.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use billflow_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use billflow_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version or a
    /// domain-level conflict such as a claimed stock-sync slot).
    Concurrency(String),
    /// Domain validation failure (deterministic).
    Validation(String),
    /// Domain invariant failure (deterministic).
    InvariantViolation(String),
    /// Domain cooldown still active.
    RateLimited { retry_after_secs: i64 },
    /// Domain authorization failure.
    Unauthorized,
    /// Domain-level not found.
    NotFound,
    /// Failed to deserialize historical event payloads.
    Deserialize(String),
    /// Persisting to the event store failed.
    Store(EventStoreError),
    /// Publication failed after a successful append.
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::RateLimited { retry_after_secs } => {
                DispatchError::RateLimited { retry_after_secs }
            }
            DomainError::Unauthorized => DispatchError::Unauthorized,
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run against the in-memory
/// implementations and production swaps in Postgres without touching
/// domain code.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full pipeline.
    ///
    /// Returns the committed events; an empty vector means the command was
    /// a no-op for the current state (nothing appended or published).
    pub async fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: billflow_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load history
        let history = self.store.load_stream(aggregate_id).await?;
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 4) Persist (append-only, optimistic)
        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected).await?;

        // 5) Publish committed events (after append)
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Defense in depth against a buggy backend: the stream must belong to
    // the requested aggregate and be strictly increasing.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                format!("loaded stream contains wrong aggregate_id at index {idx}"),
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                format!(
                    "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                    e.sequence_number
                ),
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use billflow_billing::{
        ConfirmPayment, CreateDraft, CustomerDetails, Invoice, InvoiceCommand, InvoiceId,
        InvoiceLine, PaymentMethod, SendEmail,
    };
    use billflow_core::UserId;
    use billflow_events::InMemoryEventBus;
    use chrono::Utc;

    use crate::event_store::InMemoryEventStore;

    type TestDispatcher =
        CommandDispatcher<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

    fn dispatcher() -> (
        TestDispatcher,
        Arc<InMemoryEventStore>,
        Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>,
    ) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        (CommandDispatcher::new(store.clone(), bus.clone()), store, bus)
    }

    fn draft_cmd(invoice_id: InvoiceId) -> InvoiceCommand {
        InvoiceCommand::CreateDraft(CreateDraft {
            invoice_id,
            invoice_number: "INV-42".to_string(),
            owner: UserId::new(),
            customer: CustomerDetails {
                name: "Ada GmbH".to_string(),
                email: "billing@ada.example".to_string(),
                phone: None,
                address: None,
            },
            lines: vec![InvoiceLine {
                line_no: 1,
                product_ref: Some("prod_1".to_string()),
                description: "Widget".to_string(),
                quantity: 1,
                unit_price: 100,
            }],
            due_date: None,
            occurred_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn dispatch_appends_and_publishes_in_order() {
        let (dispatcher, _store, bus) = dispatcher();
        let sub = bus.subscribe();

        let agg = AggregateId::new();
        let invoice_id = InvoiceId::new(agg);
        let committed = dispatcher
            .dispatch::<Invoice>(agg, "billing.invoice", draft_cmd(invoice_id), |id| {
                Invoice::empty(InvoiceId::new(id))
            })
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(committed[0].event_type, "billing.invoice.draft_created");

        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.sequence_number(), 1);
        assert_eq!(envelope.aggregate_type(), "billing.invoice");
    }

    #[tokio::test]
    async fn rehydration_feeds_later_commands() {
        let (dispatcher, _store, _bus) = dispatcher();

        let agg = AggregateId::new();
        let invoice_id = InvoiceId::new(agg);
        dispatcher
            .dispatch::<Invoice>(agg, "billing.invoice", draft_cmd(invoice_id), |id| {
                Invoice::empty(InvoiceId::new(id))
            })
            .await
            .unwrap();

        let committed = dispatcher
            .dispatch::<Invoice>(
                agg,
                "billing.invoice",
                InvoiceCommand::SendEmail(SendEmail {
                    invoice_id,
                    token: billflow_billing::PublicToken::generate(),
                    cooldown_secs: 0,
                    occurred_at: Utc::now(),
                }),
                |id| Invoice::empty(InvoiceId::new(id)),
            )
            .await
            .unwrap();

        // Token issuance + sent, continuing the stream.
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].sequence_number, 2);
        assert_eq!(committed[1].sequence_number, 3);
    }

    #[tokio::test]
    async fn no_op_commands_append_nothing() {
        let (dispatcher, store, _bus) = dispatcher();

        let agg = AggregateId::new();
        let invoice_id = InvoiceId::new(agg);
        dispatcher
            .dispatch::<Invoice>(agg, "billing.invoice", draft_cmd(invoice_id), |id| {
                Invoice::empty(InvoiceId::new(id))
            })
            .await
            .unwrap();

        let confirm = InvoiceCommand::ConfirmPayment(ConfirmPayment {
            invoice_id,
            method: PaymentMethod::Stripe,
            gateway_payment_id: Some("pi_1".to_string()),
            occurred_at: Utc::now(),
        });
        dispatcher
            .dispatch::<Invoice>(agg, "billing.invoice", confirm.clone(), |id| {
                Invoice::empty(InvoiceId::new(id))
            })
            .await
            .unwrap();
        let len_after_first = store.load_stream(agg).await.unwrap().len();

        // Replay: idempotent no-op, stream untouched.
        let replay = dispatcher
            .dispatch::<Invoice>(agg, "billing.invoice", confirm, |id| {
                Invoice::empty(InvoiceId::new(id))
            })
            .await
            .unwrap();
        assert!(replay.is_empty());
        assert_eq!(store.load_stream(agg).await.unwrap().len(), len_after_first);
    }

    #[tokio::test]
    async fn domain_errors_map_to_dispatch_errors() {
        let (dispatcher, _store, _bus) = dispatcher();

        let agg = AggregateId::new();
        // SendEmail against an aggregate that was never created.
        let err = dispatcher
            .dispatch::<Invoice>(
                agg,
                "billing.invoice",
                InvoiceCommand::SendEmail(SendEmail {
                    invoice_id: InvoiceId::new(agg),
                    token: billflow_billing::PublicToken::generate(),
                    cooldown_secs: 0,
                    occurred_at: Utc::now(),
                }),
                |id| Invoice::empty(InvoiceId::new(id)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));
    }
}
