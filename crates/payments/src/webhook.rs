//! Typed view over the gateway's webhook event envelope.
//!
//! The gateway may report one purchase as a "checkout session completed"
//! event, an underlying "payment succeeded" event, or both. Each known
//! event type gets its own payload shape; everything else lands in
//! `Unknown` and is acknowledged without action.

use serde::Deserialize;

/// A parsed gateway event, reduced to what reconciliation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    CheckoutSessionCompleted {
        session_id: String,
        invoice_ref: Option<String>,
        payment_id: Option<String>,
    },
    PaymentSucceeded {
        payment_id: String,
        invoice_ref: Option<String>,
    },
    PaymentFailed {
        payment_id: String,
        invoice_ref: Option<String>,
    },
    Unknown {
        event_type: String,
    },
}

impl GatewayEvent {
    /// The invoice identifier carried in event metadata, if any.
    pub fn invoice_ref(&self) -> Option<&str> {
        match self {
            GatewayEvent::CheckoutSessionCompleted { invoice_ref, .. }
            | GatewayEvent::PaymentSucceeded { invoice_ref, .. }
            | GatewayEvent::PaymentFailed { invoice_ref, .. } => invoice_ref.as_deref(),
            GatewayEvent::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    invoice_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    payment_intent: Option<PaymentIntentRef>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

/// A payment-intent field may arrive as a bare id or an expanded object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PaymentIntentRef {
    Id(String),
    Object(PaymentIntentObject),
}

impl PaymentIntentRef {
    fn id(&self) -> &str {
        match self {
            PaymentIntentRef::Id(id) => id,
            PaymentIntentRef::Object(obj) => &obj.id,
        }
    }

    fn invoice_ref(&self) -> Option<String> {
        match self {
            PaymentIntentRef::Id(_) => None,
            PaymentIntentRef::Object(obj) => {
                obj.metadata.as_ref().and_then(|m| m.invoice_id.clone())
            }
        }
    }
}

/// Parse a raw webhook body into a [`GatewayEvent`].
///
/// Returns an error only when the envelope itself is not the expected JSON
/// shape; unrecognized event types parse successfully into `Unknown`.
pub fn parse_event(body: &[u8]) -> Result<GatewayEvent, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(body)?;

    let event = match envelope.event_type.as_str() {
        "checkout.session.completed" => {
            let object: CheckoutSessionObject = serde_json::from_value(envelope.data.object)?;
            // Primary metadata on the session; fall back to the expanded
            // payment intent when the session itself carries none.
            let invoice_ref = object
                .metadata
                .as_ref()
                .and_then(|m| m.invoice_id.clone())
                .or_else(|| {
                    object
                        .payment_intent
                        .as_ref()
                        .and_then(|pi| pi.invoice_ref())
                });
            GatewayEvent::CheckoutSessionCompleted {
                session_id: object.id,
                invoice_ref,
                payment_id: object.payment_intent.as_ref().map(|pi| pi.id().to_string()),
            }
        }
        "payment_intent.succeeded" => {
            let object: PaymentIntentObject = serde_json::from_value(envelope.data.object)?;
            GatewayEvent::PaymentSucceeded {
                invoice_ref: object.metadata.as_ref().and_then(|m| m.invoice_id.clone()),
                payment_id: object.id,
            }
        }
        "payment_intent.payment_failed" => {
            let object: PaymentIntentObject = serde_json::from_value(envelope.data.object)?;
            GatewayEvent::PaymentFailed {
                invoice_ref: object.metadata.as_ref().and_then(|m| m.invoice_id.clone()),
                payment_id: object.id,
            }
        }
        other => GatewayEvent::Unknown {
            event_type: other.to_string(),
        },
    };

    Ok(event)
}
