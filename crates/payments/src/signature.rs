//! Webhook signature verification.
//!
//! The gateway signs each delivery with an HMAC-SHA256 over
//! `"{timestamp}.{raw body}"` and sends it as a header of the form
//! `t=<unix seconds>,v1=<hex digest>[,v1=<hex digest>...]` (multiple `v1`
//! entries appear while a signing secret is being rotated). Verification
//! fails closed: a malformed header, a stale timestamp or a digest
//! mismatch all reject the delivery before any state is touched.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    /// Timestamp outside the tolerance window (replay protection).
    #[error("signature timestamp outside tolerance window")]
    StaleTimestamp,

    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies gateway webhook signatures with a shared secret.
#[derive(Clone)]
pub struct WebhookSignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookSignatureVerifier {
    pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify `header` against `payload` at time `now`.
    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let (timestamp, candidates) = parse_signature_header(header)?;

        let age = (now.timestamp() - timestamp).abs();
        if age > self.tolerance_secs {
            return Err(SignatureError::StaleTimestamp);
        }

        for candidate in &candidates {
            let decoded = match hex::decode(candidate) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
                .expect("HMAC accepts keys of any size");
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            // Constant-time comparison.
            if mac.verify_slice(&decoded).is_ok() {
                return Ok(());
            }
        }

        Err(SignatureError::Mismatch)
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, Vec<&str>), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    SignatureError::MalformedHeader("timestamp is not an integer".to_string())
                })?);
            }
            "v1" => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| SignatureError::MalformedHeader("missing timestamp".to_string()))?;
    if candidates.is_empty() {
        return Err(SignatureError::MalformedHeader(
            "missing v1 signature".to_string(),
        ));
    }

    Ok((timestamp, candidates))
}
