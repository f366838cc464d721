//! Who is acting, and what they may touch.

use serde::Serialize;

use super::error::{AdminError, AdminResult};
use crate::db::Role;

/// Name of the organization system administrators belong to
pub const ADMIN_ORG: &str = "admin";

/// The caller's organization membership, attached to every authenticated request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub user_id: i64,
    pub user_name: String,
    pub org_id: i64,
    pub org_name: String,
    pub role: Role,
}

impl Membership {
    /// Membership used for the admin token and for agent callbacks
    pub fn system(admin_org_id: i64) -> Self {
        Self {
            user_id: 0,
            user_name: "system".to_string(),
            org_id: admin_org_id,
            org_name: ADMIN_ORG.to_string(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn check_permission(&self, required: Role) -> bool {
        self.role.has_at_least(required)
    }

    /// Admins may touch anything; everyone else only rows of their own
    /// organization, and only with a sufficient role.
    pub fn validate_owner(&self, required: Role, owner: i64) -> bool {
        if self.is_admin() {
            return true;
        }
        self.org_id == owner && self.role.has_at_least(required)
    }

    /// Owner filter for read queries: `None` means unrestricted
    pub fn owner_scope(&self) -> Option<i64> {
        if self.is_admin() {
            None
        } else {
            Some(self.org_id)
        }
    }

    pub fn require(&self, required: Role, action: &str) -> AdminResult<()> {
        if self.check_permission(required) {
            Ok(())
        } else {
            tracing::warn!(user = %self.user_name, org = %self.org_name, role = %self.role, "Not authorized to {}", action);
            Err(AdminError::permission_denied(format!(
                "Not authorized to {}",
                action
            )))
        }
    }

    pub fn require_owner(&self, required: Role, owner: i64, action: &str) -> AdminResult<()> {
        if self.validate_owner(required, owner) {
            Ok(())
        } else {
            tracing::warn!(user = %self.user_name, org = %self.org_name, owner, "Not authorized to {}", action);
            Err(AdminError::permission_denied(format!(
                "Not authorized to {}",
                action
            )))
        }
    }

    pub fn require_admin(&self, action: &str) -> AdminResult<()> {
        self.require(Role::Admin, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::error::ErrorKind;

    fn member(org_id: i64, role: Role) -> Membership {
        Membership {
            user_id: 7,
            user_name: "alice".to_string(),
            org_id,
            org_name: "acme".to_string(),
            role,
        }
    }

    #[test]
    fn test_check_permission() {
        assert!(member(1, Role::Writer).check_permission(Role::Reader));
        assert!(member(1, Role::Writer).check_permission(Role::Writer));
        assert!(!member(1, Role::Reader).check_permission(Role::Writer));
    }

    #[test]
    fn test_validate_owner() {
        let writer = member(1, Role::Writer);
        assert!(writer.validate_owner(Role::Writer, 1));
        assert!(!writer.validate_owner(Role::Writer, 2));
        assert!(!writer.validate_owner(Role::Owner, 1));

        let admin = member(99, Role::Admin);
        assert!(admin.validate_owner(Role::Owner, 2));
    }

    #[test]
    fn test_owner_scope() {
        assert_eq!(member(3, Role::Reader).owner_scope(), Some(3));
        assert_eq!(Membership::system(1).owner_scope(), None);
    }

    #[test]
    fn test_require_errors() {
        let err = member(1, Role::Reader)
            .require(Role::Writer, "create load balancers")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), "Not authorized to create load balancers");

        assert!(member(1, Role::Owner)
            .require_owner(Role::Writer, 2, "delete the backend")
            .is_err());
    }
}
