//! `billflow-auth` — staff identity, role policy and login protection.
//!
//! Decoupled from HTTP and storage: the API layer verifies tokens and
//! enforces the role policy before dispatching account commands.

pub mod account;
pub mod claims;
pub mod jwt;
pub mod password;
pub mod roles;
pub mod throttle;

pub use account::{
    AccountCreated, AccountDeactivated, AccountEvent, CreateAccount, DeactivateAccount,
    StaffAccount, StaffAccountCommand,
};
pub use claims::{Claims, TokenValidationError, validate_claims};
pub use jwt::{Hs256Tokens, TokenError};
pub use password::{PasswordError, hash_password, verify_password};
pub use roles::StaffRole;
pub use throttle::LoginThrottle;
