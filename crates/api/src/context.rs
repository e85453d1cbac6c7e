use billflow_auth::StaffRole;
use billflow_core::UserId;

/// Authenticated staff identity for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
    email: String,
    role: StaffRole,
}

impl PrincipalContext {
    pub fn new(user_id: UserId, email: String, role: StaffRole) -> Self {
        Self {
            user_id,
            email,
            role,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn role(&self) -> StaffRole {
        self.role
    }
}
