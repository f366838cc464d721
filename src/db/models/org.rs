//! Organizations, users, memberships and sessions.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Organization roles with hierarchical permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    None,
    /// Read resources of the organization
    Reader,
    /// Create, change and delete resources
    Writer,
    /// Manage members of the organization
    Owner,
    /// Every organization, plus system resources
    Admin,
}

impl Role {
    /// Check if this role has at least the specified permission level
    pub fn has_at_least(&self, required: Role) -> bool {
        self.level() >= required.level()
    }

    /// Get the permission level (higher = more permissions)
    pub fn level(&self) -> u8 {
        match self {
            Role::None => 0,
            Role::Reader => 1,
            Role::Writer => 2,
            Role::Owner => 3,
            Role::Admin => 4,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
            Role::Owner => write!(f, "owner"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Role::None),
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Role::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub owner_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub username: String,
    pub password_hash: String,
    /// Organization used when a request names none
    pub org_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i64,
    pub uuid: String,
    pub username: String,
    pub org_id: i64,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            uuid: user.uuid,
            username: user.username,
            org_id: user.org_id,
            created_at: user.created_at,
        }
    }
}

/// Membership row linking a user to an organization with a role
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub org_id: i64,
    pub org_name: String,
    pub role: String,
    pub created_at: String,
}

impl Member {
    pub fn role_enum(&self) -> Role {
        Role::from(self.role.clone())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub token_hash: String,
    pub expires_at: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: String,
    pub user: UserResponse,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
    /// Existing user made Owner of the new organization
    pub owner_username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub username: String,
    pub role: Role,
}
