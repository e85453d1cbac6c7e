//! Payment gateway clients implementing [`CheckoutGateway`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use billflow_payments::{CheckoutGateway, CheckoutSession, CheckoutSessionSpec, GatewayError};

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the hosted-checkout API.
///
/// Sessions are created with a form-encoded POST against
/// `/v1/checkout/sessions`, bearer-authenticated with the secret key; the
/// invoice id travels in session metadata and comes back to us through the
/// webhook.
pub struct StripeCheckoutClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeCheckoutClient {
    pub fn new(secret_key: impl Into<String>) -> Result<Self, GatewayError> {
        let secret_key = secret_key.into();
        if secret_key.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "gateway secret key is empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            secret_key,
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API host (tests, mock servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn session_form(spec: &CheckoutSessionSpec) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), spec.success_url.clone()),
            ("cancel_url".to_string(), spec.cancel_url.clone()),
            ("customer_email".to_string(), spec.customer_email.clone()),
            (
                "metadata[invoice_id]".to_string(),
                spec.invoice_ref.clone(),
            ),
            (
                "payment_intent_data[metadata][invoice_id]".to_string(),
                spec.invoice_ref.clone(),
            ),
        ];
        for (i, item) in spec.line_items.iter().enumerate() {
            form.push((
                format!("line_items[{i}][price_data][currency]"),
                spec.currency.to_string(),
            ));
            form.push((
                format!("line_items[{i}][price_data][product_data][name]"),
                item.name.clone(),
            ));
            form.push((
                format!("line_items[{i}][price_data][unit_amount]"),
                item.unit_amount.to_string(),
            ));
            form.push((format!("line_items[{i}][quantity]"), item.quantity.to_string()));
        }
        form
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
}

#[async_trait]
impl CheckoutGateway for StripeCheckoutClient {
    async fn create_session(
        &self,
        spec: &CheckoutSessionSpec,
    ) -> Result<CheckoutSession, GatewayError> {
        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&Self::session_form(spec))
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Response(format!(
                "checkout session creation returned {status}: {body}"
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Response(e.to_string()))?;

        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }
}

/// Stand-in used when no gateway credential is configured: every call
/// fails with a configuration error, surfaced to the caller as such.
pub struct UnconfiguredGateway;

#[async_trait]
impl CheckoutGateway for UnconfiguredGateway {
    async fn create_session(
        &self,
        _spec: &CheckoutSessionSpec,
    ) -> Result<CheckoutSession, GatewayError> {
        Err(GatewayError::Configuration(
            "STRIPE_SECRET_KEY is not set".to_string(),
        ))
    }
}

/// Recording fake for tests: hands out deterministic sessions and keeps
/// the specs it saw.
#[derive(Default)]
pub struct RecordingCheckoutGateway {
    requests: Mutex<Vec<CheckoutSessionSpec>>,
}

impl RecordingCheckoutGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<CheckoutSessionSpec> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckoutGateway for RecordingCheckoutGateway {
    async fn create_session(
        &self,
        spec: &CheckoutSessionSpec,
    ) -> Result<CheckoutSession, GatewayError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(spec.clone());
            requests.len()
        };
        Ok(CheckoutSession {
            id: format!("cs_test_{n}"),
            url: format!("https://checkout.test/cs_test_{n}"),
        })
    }
}
