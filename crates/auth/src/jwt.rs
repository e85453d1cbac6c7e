//! HS256 session tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;

use billflow_core::UserId;

use crate::claims::{Claims, validate_claims};
use crate::roles::StaffRole;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to encode token: {0}")]
    Encode(String),

    #[error("invalid token")]
    Invalid,

    #[error("token has expired")]
    Expired,
}

/// Issues and verifies HS256 staff session tokens with a shared secret.
pub struct Hs256Tokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl Hs256Tokens {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(
        &self,
        user_id: UserId,
        email: &str,
        role: StaffRole,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Encode(e.to_string()))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        // Expiry is re-checked below against the injected clock; the
        // library check stays on as defense against missing claims.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = false;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| TokenError::Invalid)?;

        validate_claims(&data.claims, now).map_err(|e| match e {
            crate::claims::TokenValidationError::Expired => TokenError::Expired,
            _ => TokenError::Invalid,
        })?;

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Hs256Tokens {
        Hs256Tokens::new(b"test-secret", Duration::minutes(30))
    }

    #[test]
    fn issued_tokens_verify_and_round_trip_claims() {
        let now = Utc::now();
        let user_id = UserId::new();
        let token = tokens()
            .issue(user_id, "kim@example.com", StaffRole::Admin, now)
            .unwrap();

        let claims = tokens().verify(&token, now).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "kim@example.com");
        assert_eq!(claims.role, StaffRole::Admin);
    }

    #[test]
    fn tokens_expire_after_their_ttl() {
        let now = Utc::now();
        let token = tokens()
            .issue(UserId::new(), "kim@example.com", StaffRole::Employee, now)
            .unwrap();

        let later = now + Duration::minutes(31);
        assert!(matches!(
            tokens().verify(&token, later),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let now = Utc::now();
        let other = Hs256Tokens::new(b"other-secret", Duration::minutes(30));
        let token = other
            .issue(UserId::new(), "kim@example.com", StaffRole::Employee, now)
            .unwrap();

        assert!(matches!(
            tokens().verify(&token, now),
            Err(TokenError::Invalid)
        ));
    }
}
