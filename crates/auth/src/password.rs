//! Password hashing (bcrypt).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("failed to hash password: {0}")]
    Hash(String),
}

/// Hash a password for storage on the account event.
pub fn hash_password(plain: &str) -> Result<String, PasswordError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST).map_err(|e| PasswordError::Hash(e.to_string()))
}

/// Verify a login attempt against a stored hash.
///
/// An unparseable hash counts as a failed verification, not an error — the
/// login path treats both the same way.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_verify_and_reject_wrong_passwords() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn garbage_hashes_never_verify() {
        assert!(!verify_password("hunter2", "not-a-bcrypt-hash"));
    }
}
