//! Staff roles and the account-management policy.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use billflow_core::DomainError;

/// Role of a staff account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    SuperAdmin,
    Admin,
    Employee,
}

impl StaffRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StaffRole::SuperAdmin => "super_admin",
            StaffRole::Admin => "admin",
            StaffRole::Employee => "employee",
        }
    }

    /// Whether `self` may create an account with role `target`.
    ///
    /// An admin only manages employees; a super admin manages any role.
    pub fn can_create(self, target: StaffRole) -> bool {
        match self {
            StaffRole::SuperAdmin => true,
            StaffRole::Admin => target == StaffRole::Employee,
            StaffRole::Employee => false,
        }
    }

    /// Whether `self` may delete an account with role `target`.
    ///
    /// Super admins cannot delete each other — removing the last one would
    /// lock the store out of its own administration.
    pub fn can_delete(self, target: StaffRole) -> bool {
        match self {
            StaffRole::SuperAdmin => target != StaffRole::SuperAdmin,
            StaffRole::Admin => target == StaffRole::Employee,
            StaffRole::Employee => false,
        }
    }
}

impl core::fmt::Display for StaffRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StaffRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(StaffRole::SuperAdmin),
            "admin" => Ok(StaffRole::Admin),
            "employee" => Ok(StaffRole::Employee),
            other => Err(DomainError::validation(format!(
                "unknown role '{other}' (expected super_admin, admin or employee)"
            ))),
        }
    }
}
