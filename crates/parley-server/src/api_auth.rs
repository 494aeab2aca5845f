//! Authentication endpoints: password signup/login and Google federated login.

use crate::AppState;
use axum::{extract::Extension, http::StatusCode, response::Json};
use parley_chats::{
    create_user, find_credentials_by_email, upsert_federated_user, CreateUserParams, User,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Maximum length for an email address.
const MAX_EMAIL_LEN: usize = 320;
/// Maximum length for a display name.
const MAX_NAME_LEN: usize = 256;
/// Minimum password length for new accounts.
const MIN_PASSWORD_LEN: usize = 6;
/// bcrypt truncates beyond 72 bytes; reject rather than silently truncate.
const MAX_PASSWORD_LEN: usize = 72;

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct GoogleLoginRequest {
    /// The Google-issued ID token, as handed to the browser by the sign-in
    /// widget.
    pub credential: String,
}

/// A user profile as delivered to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: String,
}

impl From<User> for UserPayload {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            name: u.name,
            avatar_url: u.avatar_url,
            created_at: u.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserPayload,
}

/// Claims fields from Google's tokeninfo endpoint that we care about.
#[derive(Debug, Deserialize)]
struct GoogleTokenInfo {
    aud: String,
    email: String,
    #[serde(default)]
    email_verified: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Signs an access token for a user and wraps it with the profile payload.
fn issue_token(state: &AppState, user: User) -> Result<Json<AuthResponse>, StatusCode> {
    let token = parley_auth::sign_access_token(
        &state.jwt_secret,
        &user.id,
        &user.email,
        &user.name,
        user.avatar_url.as_deref(),
        state.token_ttl_secs,
    )
    .map_err(|e| {
        tracing::error!(error = %e, "failed to sign access token");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// POST /api/auth/signup
pub async fn signup_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<SignupRequest>,
) -> Result<Json<AuthResponse>, StatusCode> {
    let email = payload.email.trim().to_lowercase();
    let name = payload.name.trim().to_string();

    if email.is_empty() || email.len() > MAX_EMAIL_LEN || !email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }
    if payload.password.len() < MIN_PASSWORD_LEN || payload.password.len() > MAX_PASSWORD_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    // bcrypt is CPU-bound; keep it off the async runtime.
    let password = payload.password;
    let password_hash = tokio::task::spawn_blocking(move || parley_auth::hash_password(&password))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            tracing::error!(error = %e, "failed to hash password");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let params = CreateUserParams {
        id: Uuid::new_v4().to_string(),
        email,
        password_hash: Some(password_hash),
        name,
        avatar_url: None,
    };

    let pool = state.pool.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        create_user(&conn, &params).map_err(|e| {
            // Duplicate email -> 409 Conflict
            if let parley_chats::StoreError::Database(rusqlite::Error::SqliteFailure(
                error_code,
                _,
            )) = e
            {
                if error_code.code == rusqlite::ffi::ErrorCode::ConstraintViolation {
                    return StatusCode::CONFLICT;
                }
            }
            tracing::error!(error = %e, "failed to create user");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    tracing::info!(user_id = %user.id, "user signed up");
    issue_token(&state, user)
}

/// POST /api/auth/login
pub async fn login_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, StatusCode> {
    let email = payload.email.trim().to_lowercase();

    let pool = state.pool.clone();
    let lookup = email.clone();
    let credentials = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        find_credentials_by_email(&conn, &lookup).map_err(|e| {
            tracing::error!(error = %e, "credential lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    // Unknown account, federated-only account, and wrong password all
    // collapse to the same 401 so a failed login reveals nothing about
    // which part was wrong.
    let Some(credentials) = credentials else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(hash) = credentials.password_hash else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let password = payload.password;
    let verified =
        tokio::task::spawn_blocking(move || parley_auth::verify_password(&password, &hash))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .map_err(|e| {
                tracing::error!(error = %e, "password verification failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

    if !verified {
        return Err(StatusCode::UNAUTHORIZED);
    }

    tracing::info!(user_id = %credentials.user.id, "user logged in");
    issue_token(&state, credentials.user)
}

/// POST /api/auth/google
///
/// Verifies a Google ID token against the tokeninfo endpoint, then gets or
/// creates the matching local account.
pub async fn google_login_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<GoogleLoginRequest>,
) -> Result<Json<AuthResponse>, StatusCode> {
    let Some(ref client_id) = state.google_client_id else {
        tracing::error!("google login attempted but no client id is configured");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };

    if payload.credential.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let response = state
        .http_client
        .get("https://oauth2.googleapis.com/tokeninfo")
        .query(&[("id_token", payload.credential.as_str())])
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "tokeninfo request failed");
            StatusCode::BAD_GATEWAY
        })?;

    if !response.status().is_success() {
        tracing::debug!(status = %response.status(), "google rejected id token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let info: GoogleTokenInfo = response.json().await.map_err(|e| {
        tracing::error!(error = %e, "tokeninfo response parse failed");
        StatusCode::BAD_GATEWAY
    })?;

    if info.aud != *client_id {
        tracing::warn!("google id token audience mismatch");
        return Err(StatusCode::UNAUTHORIZED);
    }
    if info.email_verified.as_deref() != Some("true") {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let email = info.email.to_lowercase();
    let name = info.name.unwrap_or_else(|| email.clone());
    let avatar_url = info.picture;

    let pool = state.pool.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        upsert_federated_user(
            &conn,
            &Uuid::new_v4().to_string(),
            &email,
            &name,
            avatar_url.as_deref(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "federated user upsert failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    tracing::info!(user_id = %user.id, "user logged in via google");
    issue_token(&state, user)
}
