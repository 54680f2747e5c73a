//! Well-known role names and the resolved caller identity.
//!
//! Roles are issued by the external identity provider; the engine only
//! consumes them.

use serde::{Deserialize, Serialize};

use crate::types::DbId;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_OPERATOR: &str = "operator";
pub const ROLE_READ_ONLY: &str = "read_only";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    ReadOnly,
}

impl Role {
    /// Parse a role name as carried in a token. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ROLE_ADMIN => Some(Role::Admin),
            ROLE_OPERATOR => Some(Role::Operator),
            ROLE_READ_ONLY => Some(Role::ReadOnly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => ROLE_ADMIN,
            Role::Operator => ROLE_OPERATOR,
            Role::ReadOnly => ROLE_READ_ONLY,
        }
    }

    /// Whether this role may submit and stop jobs.
    pub fn can_operate(self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An already-authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: DbId,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: DbId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins see every job; everyone else only their own.
    pub fn can_view(&self, owner_id: DbId) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_role_names() {
        assert_eq!(Role::from_name("admin"), Some(Role::Admin));
        assert_eq!(Role::from_name("operator"), Some(Role::Operator));
        assert_eq!(Role::from_name("read_only"), Some(Role::ReadOnly));
        assert_eq!(Role::from_name("root"), None);
    }

    #[test]
    fn only_admin_and_operator_can_operate() {
        assert!(Role::Admin.can_operate());
        assert!(Role::Operator.can_operate());
        assert!(!Role::ReadOnly.can_operate());
    }

    #[test]
    fn viewing_requires_ownership_unless_admin() {
        let op = Identity::new(7, Role::Operator);
        assert!(op.can_view(7));
        assert!(!op.can_view(8));
        assert!(Identity::new(1, Role::Admin).can_view(8));
    }
}
