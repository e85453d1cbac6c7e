//! Staff account aggregate (event-sourced).
//!
//! Role-policy enforcement (who may create/delete whom) happens at the API
//! boundary before dispatch; the aggregate owns the account's own
//! invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use billflow_core::{Aggregate, AggregateRoot, DomainError, UserId};
use billflow_events::Event;

use crate::roles::StaffRole;

/// Aggregate root: a staff member's account.
#[derive(Debug, Clone)]
pub struct StaffAccount {
    id: UserId,
    email: String,
    display_name: String,
    role: StaffRole,
    password_hash: String,
    active: bool,
    version: u64,
    created: bool,
}

impl StaffAccount {
    pub fn empty(id: UserId) -> Self {
        Self {
            id,
            email: String::new(),
            display_name: String::new(),
            role: StaffRole::Employee,
            password_hash: String::new(),
            active: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> UserId {
        self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn role(&self) -> StaffRole {
        self.role
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl AggregateRoot for StaffAccount {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: create a staff account.
///
/// Carries the already-computed bcrypt hash; hashing is nondeterministic
/// and therefore happens in the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: StaffRole,
    pub password_hash: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: deactivate (delete) a staff account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivateAccount {
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StaffAccountCommand {
    Create(CreateAccount),
    Deactivate(DeactivateAccount),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCreated {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: StaffRole,
    pub password_hash: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDeactivated {
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccountEvent {
    Created(AccountCreated),
    Deactivated(AccountDeactivated),
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Created(_) => "auth.account.created",
            AccountEvent::Deactivated(_) => "auth.account.deactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::Created(e) => e.occurred_at,
            AccountEvent::Deactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StaffAccount {
    type Command = StaffAccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::Created(e) => {
                self.id = e.user_id;
                self.email = e.email.clone();
                self.display_name = e.display_name.clone();
                self.role = e.role;
                self.password_hash = e.password_hash.clone();
                self.active = true;
                self.created = true;
            }
            AccountEvent::Deactivated(_) => {
                self.active = false;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StaffAccountCommand::Create(cmd) => self.handle_create(cmd),
            StaffAccountCommand::Deactivate(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl StaffAccount {
    fn handle_create(&self, cmd: &CreateAccount) -> Result<Vec<AccountEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("account already exists"));
        }
        if cmd.email.trim().is_empty() || !cmd.email.contains('@') {
            return Err(DomainError::validation("invalid email format"));
        }
        if cmd.display_name.trim().is_empty() {
            return Err(DomainError::validation("display name cannot be empty"));
        }
        if cmd.password_hash.trim().is_empty() {
            return Err(DomainError::validation("password hash cannot be empty"));
        }

        Ok(vec![AccountEvent::Created(AccountCreated {
            user_id: cmd.user_id,
            email: cmd.email.trim().to_lowercase(),
            display_name: cmd.display_name.trim().to_string(),
            role: cmd.role,
            password_hash: cmd.password_hash.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(
        &self,
        cmd: &DeactivateAccount,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::NotFound);
        }
        if !self.active {
            return Err(DomainError::conflict("account is already deactivated"));
        }

        Ok(vec![AccountEvent::Deactivated(AccountDeactivated {
            user_id: cmd.user_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
