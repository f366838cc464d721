//! Password hashing, sessions and the authentication middlewares.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
    Json,
};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::admin::{org, Membership};
use crate::db::{actions, new_uuid, now, resource_types, LoginRequest, LoginResponse, User, UserResponse};
use crate::AppState;

use super::audit::{audit_log, ClientIp};
use super::error::ApiError;

/// Header naming the organization a session request acts in
pub const ORG_HEADER: &str = "X-Org";

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Generate a random session token
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// Hash a token for storage
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn tokens_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    expected.len() == provided.len() && expected.ct_eq(provided).into()
}

/// Extract the token from request headers
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(header) = headers.get("Authorization").and_then(|h| h.to_str().ok()) {
        return Some(header.strip_prefix("Bearer ").unwrap_or(header).trim());
    }

    headers.get("X-API-Key").and_then(|h| h.to_str().ok())
}

/// Resolve the caller's membership from a token.
///
/// The admin token maps to the system membership. A session token maps to the
/// user's membership in the organization named by `org_name`, or in the
/// user's default organization.
pub async fn resolve_membership(
    state: &AppState,
    token: &str,
    org_name: Option<&str>,
) -> Result<Membership, ApiError> {
    if tokens_match(&state.config.auth.admin_token, token) {
        return Ok(state.system_member());
    }

    let mut conn = state.db.acquire().await?;
    let user: Option<User> = sqlx::query_as(
        r#"
        SELECT u.* FROM users u
        INNER JOIN sessions s ON s.user_id = u.id
        WHERE s.token_hash = ? AND s.expires_at > ?
        "#,
    )
    .bind(hash_token(token))
    .bind(now())
    .fetch_optional(&mut *conn)
    .await?;

    let user = user.ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    org::find_membership(&mut conn, &user, org_name)
        .await?
        .ok_or_else(|| {
            tracing::warn!(user = %user.username, org = ?org_name, "User is not a member of the organization");
            ApiError::forbidden("Not a member of this organization")
        })
}

/// Auth middleware for `/api`: attaches the caller's [`Membership`] to the request
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing authentication token"))?
        .to_string();
    let org_name = request
        .headers()
        .get(ORG_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let member = resolve_membership(&state, &token, org_name.as_deref()).await?;
    request.extensions_mut().insert(member);
    Ok(next.run(request).await)
}

/// Auth middleware for the agent callback route
pub async fn agent_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_token(request.headers()) {
        Some(token) if tokens_match(&state.config.auth.agent_token, token) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!("Rejected agent callback with a bad token");
            Err(ApiError::unauthorized("Invalid agent token"))
        }
    }
}

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;
    let user = org::find_user_by_name(&mut conn, &request.username).await?;

    let user = match user {
        Some(user) if verify_password(&request.password, &user.password_hash) => user,
        _ => {
            tracing::info!(username = %request.username, "Failed login attempt");
            return Err(ApiError::unauthorized("Invalid credentials"));
        }
    };

    let token = generate_token();
    let expires_at = (chrono::Utc::now()
        + chrono::Duration::hours(state.config.auth.session_ttl_hours))
    .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);

    sqlx::query(
        "INSERT INTO sessions (id, user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new_uuid())
    .bind(user.id)
    .bind(hash_token(&token))
    .bind(&expires_at)
    .bind(now())
    .execute(&mut *conn)
    .await?;
    drop(conn);

    audit_log(
        &state,
        Some(user.id),
        Some(user.org_id),
        ip.as_deref(),
        actions::AUTH_LOGIN,
        resource_types::USER,
        Some(&user.uuid),
        Some(&user.username),
        None,
    )
    .await;

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user: UserResponse::from(user),
    }))
}
