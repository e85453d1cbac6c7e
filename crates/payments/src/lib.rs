//! `billflow-payments` — payment gateway boundary.
//!
//! Everything the reconciliation pipeline needs from the hosted-checkout
//! gateway, kept free of transport concerns: webhook signature
//! verification, the typed event envelope, and checkout-session building.
//! The HTTP client implementing [`CheckoutGateway`] lives in infra.

pub mod checkout;
pub mod signature;
pub mod webhook;

pub use checkout::{
    CheckoutGateway, CheckoutSession, CheckoutSessionSpec, GatewayError, SessionLineItem,
    build_session_spec,
};
pub use signature::{SignatureError, WebhookSignatureVerifier};
pub use webhook::{GatewayEvent, parse_event};
