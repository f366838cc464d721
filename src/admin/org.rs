//! Organizations, users and memberships.

use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::membership::{Membership, ADMIN_ORG};
use super::AdminContext;
use crate::api::auth::hash_password;
use crate::api::validation::{validate_name, validate_password};
use crate::db::{
    new_uuid, now, AddMemberRequest, CreateOrgRequest, CreateUserRequest, Member, Organization,
    Role, User,
};

pub async fn get_org(conn: &mut SqliteConnection, id: i64) -> AdminResult<Organization> {
    sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::OwnerNotFound, "Organization not found")
}

pub async fn find_org_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> AdminResult<Option<Organization>> {
    Ok(
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn find_user_by_name(
    conn: &mut SqliteConnection,
    username: &str,
) -> AdminResult<Option<User>> {
    Ok(
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

async fn insert_org(conn: &mut SqliteConnection, name: &str, owner_id: i64) -> AdminResult<Organization> {
    let ts = now();
    let id = sqlx::query(
        "INSERT INTO organizations (uuid, name, owner_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new_uuid())
    .bind(name)
    .bind(owner_id)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    get_org(conn, id).await
}

async fn upsert_member(
    conn: &mut SqliteConnection,
    user: &User,
    org: &Organization,
    role: Role,
) -> AdminResult<Member> {
    sqlx::query(
        r#"
        INSERT INTO members (user_id, user_name, org_id, org_name, role, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, org_id) DO UPDATE SET role = excluded.role
        "#,
    )
    .bind(user.id)
    .bind(&user.username)
    .bind(org.id)
    .bind(&org.name)
    .bind(role.to_string())
    .bind(now())
    .execute(&mut *conn)
    .await?;

    let member = sqlx::query_as::<_, Member>("SELECT * FROM members WHERE user_id = ? AND org_id = ?")
        .bind(user.id)
        .bind(org.id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(member)
}

async fn insert_user(
    conn: &mut SqliteConnection,
    username: &str,
    password: &str,
) -> AdminResult<User> {
    let password_hash = hash_password(password)
        .map_err(|e| AdminError::new(ErrorKind::Unknown, format!("Failed to hash password: {}", e)))?;
    let ts = now();
    let id = sqlx::query(
        "INSERT INTO users (uuid, username, password_hash, org_id, created_at, updated_at) VALUES (?, ?, ?, 0, ?, ?)",
    )
    .bind(new_uuid())
    .bind(username)
    .bind(&password_hash)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(user)
}

/// Make sure the admin organization exists and, when a password is
/// configured, that the bootstrap admin user does too. Returns the admin org id.
pub async fn ensure_admin(
    conn: &mut SqliteConnection,
    username: &str,
    password: Option<&str>,
) -> AdminResult<i64> {
    let org = match find_org_by_name(conn, ADMIN_ORG).await? {
        Some(org) => org,
        None => {
            tracing::info!("Creating {} organization", ADMIN_ORG);
            insert_org(conn, ADMIN_ORG, 0).await?
        }
    };

    if let Some(password) = password {
        if find_user_by_name(conn, username).await?.is_none() {
            let user = insert_user(conn, username, password).await?;
            sqlx::query("UPDATE users SET org_id = ? WHERE id = ?")
                .bind(org.id)
                .bind(user.id)
                .execute(&mut *conn)
                .await?;
            sqlx::query("UPDATE organizations SET owner_id = ? WHERE id = ?")
                .bind(user.id)
                .bind(org.id)
                .execute(&mut *conn)
                .await?;
            upsert_member(conn, &user, &org, Role::Admin).await?;
            tracing::info!(username, "Created bootstrap admin user");
        }
    }

    Ok(org.id)
}

/// Resolve the membership of `user` in `org_name`, or in the user's default
/// organization when none is named
pub async fn find_membership(
    conn: &mut SqliteConnection,
    user: &User,
    org_name: Option<&str>,
) -> AdminResult<Option<Membership>> {
    let member = match org_name {
        Some(name) => {
            sqlx::query_as::<_, Member>("SELECT * FROM members WHERE user_id = ? AND org_name = ?")
                .bind(user.id)
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?
        }
        None => {
            sqlx::query_as::<_, Member>("SELECT * FROM members WHERE user_id = ? AND org_id = ?")
                .bind(user.id)
                .bind(user.org_id)
                .fetch_optional(&mut *conn)
                .await?
        }
    };

    Ok(member.map(|m| Membership {
        role: m.role_enum(),
        user_id: m.user_id,
        user_name: m.user_name,
        org_id: m.org_id,
        org_name: m.org_name,
    }))
}

pub async fn create_user(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateUserRequest,
) -> AdminResult<User> {
    cx.member.require_admin("create users")?;
    validate_name(&req.username).map_err(AdminError::invalid)?;
    validate_password(&req.password).map_err(AdminError::invalid)?;

    if find_user_by_name(conn, &req.username).await?.is_some() {
        return Err(AdminError::invalid("Username is already taken"));
    }
    if find_org_by_name(conn, &req.username).await?.is_some() {
        return Err(AdminError::invalid("An organization with this name already exists"));
    }

    let user = insert_user(conn, &req.username, &req.password).await?;
    let org = insert_org(conn, &req.username, user.id).await?;
    upsert_member(conn, &user, &org, Role::Owner).await?;

    sqlx::query("UPDATE users SET org_id = ?, updated_at = ? WHERE id = ?")
        .bind(org.id)
        .bind(now())
        .bind(user.id)
        .execute(&mut *conn)
        .await?;

    Ok(User {
        org_id: org.id,
        ..user
    })
}

pub async fn create_org(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateOrgRequest,
) -> AdminResult<Organization> {
    cx.member.require_admin("create organizations")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;

    if find_org_by_name(conn, &req.name).await?.is_some() {
        return Err(AdminError::invalid("An organization with this name already exists"));
    }

    let owner = match &req.owner_username {
        Some(username) => Some(
            find_user_by_name(conn, username)
                .await?
                .or_not_found(ErrorKind::OwnerNotFound, "Owner user not found")?,
        ),
        None => None,
    };

    let org = insert_org(conn, &req.name, owner.as_ref().map(|u| u.id).unwrap_or(0)).await?;
    if let Some(owner) = &owner {
        upsert_member(conn, owner, &org, Role::Owner).await?;
    }
    Ok(org)
}

pub async fn list_orgs(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
) -> AdminResult<Vec<Organization>> {
    let orgs = if cx.member.is_admin() {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations ORDER BY name")
            .fetch_all(&mut *conn)
            .await?
    } else {
        sqlx::query_as::<_, Organization>(
            r#"
            SELECT o.* FROM organizations o
            INNER JOIN members m ON o.id = m.org_id
            WHERE m.user_id = ?
            ORDER BY o.name
            "#,
        )
        .bind(cx.member.user_id)
        .fetch_all(&mut *conn)
        .await?
    };
    Ok(orgs)
}

pub async fn add_member(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    org_id: i64,
    req: &AddMemberRequest,
) -> AdminResult<Member> {
    cx.member
        .require_owner(Role::Owner, org_id, "manage members of this organization")?;
    if req.role == Role::Admin && !cx.member.is_admin() {
        return Err(AdminError::permission_denied("Only administrators can grant the admin role"));
    }
    if req.role == Role::None {
        return Err(AdminError::invalid("Role must be reader, writer, owner or admin"));
    }

    let org = get_org(conn, org_id).await?;
    let user = find_user_by_name(conn, &req.username)
        .await?
        .or_not_found(ErrorKind::ResourceNotFound, "User not found")?;
    upsert_member(conn, &user, &org, req.role).await
}

pub async fn list_members(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    org_id: i64,
) -> AdminResult<Vec<Member>> {
    cx.member
        .require_owner(Role::Reader, org_id, "view members of this organization")?;
    let members = sqlx::query_as::<_, Member>(
        "SELECT * FROM members WHERE org_id = ? ORDER BY user_name",
    )
    .bind(org_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(members)
}
