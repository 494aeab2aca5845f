//! Credential and session authority for Parley.
//!
//! Issues and verifies HS256-signed access tokens carrying the user's
//! identity claims, and handles password hashing. Token claims are the only
//! identity source for both REST requests and WebSocket handshakes — holders
//! of a valid token are admitted without a database round trip.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bcrypt cost factor. 10 keeps login latency in the tens of milliseconds
/// while remaining expensive enough for offline attacks.
const BCRYPT_COST: u32 = 10;

/// Errors that can occur during authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is missing, malformed, expired, or carries a bad signature.
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// Password hashing or verification failed.
    #[error("password hashing error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// Verified identity claims carried in an access token.
///
/// `sub` is the stable user id; `name` and `avatar_url` are a denormalized
/// profile snapshot taken at issue time — they may go stale until the user
/// logs in again, which is acceptable for presence display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Account email.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Optional avatar URL.
    #[serde(rename = "avatarUrl", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Signs an access token for the given identity, valid for `ttl_secs`.
pub fn sign_access_token(
    secret: &[u8],
    user_id: &str,
    email: &str,
    name: &str,
    avatar_url: Option<&str>,
    ttl_secs: i64,
) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        name: name.to_string(),
        avatar_url: avatar_url.map(str::to_string),
        iat: now,
        exp: now + ttl_secs,
    };

    Ok(encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret),
    )?)
}

/// Verifies an access token's signature and expiry, returning its claims.
pub fn verify_access_token(secret: &[u8], token: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}

/// Hashes a password for storage.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

/// Verifies a password against a stored hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    Ok(bcrypt::verify(password, hash)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-key-for-unit-tests";

    #[test]
    fn token_round_trip() {
        let token = sign_access_token(
            SECRET,
            "user-1",
            "alice@example.com",
            "Alice",
            Some("https://example.com/a.png"),
            3600,
        )
        .expect("signing should succeed");

        let claims = verify_access_token(SECRET, &token).expect("verification should succeed");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.name, "Alice");
        assert_eq!(claims.avatar_url.as_deref(), Some("https://example.com/a.png"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn token_without_avatar() {
        let token = sign_access_token(SECRET, "user-2", "bob@example.com", "Bob", None, 3600)
            .expect("signing should succeed");
        let claims = verify_access_token(SECRET, &token).expect("verification should succeed");
        assert_eq!(claims.avatar_url, None);
    }

    #[test]
    fn expired_token_rejected() {
        // Negative TTL puts exp in the past; default validation leeway is
        // 60s, so go well beyond it.
        let token = sign_access_token(SECRET, "user-1", "a@example.com", "A", None, -120)
            .expect("signing should succeed");
        let err = verify_access_token(SECRET, &token).expect_err("expired token must fail");
        match err {
            AuthError::InvalidToken(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = sign_access_token(SECRET, "user-1", "a@example.com", "A", None, 3600)
            .expect("signing should succeed");
        verify_access_token(b"a-different-secret", &token)
            .expect_err("wrong secret must fail verification");
    }

    #[test]
    fn garbage_token_rejected() {
        verify_access_token(SECRET, "not-a-jwt").expect_err("garbage must fail verification");
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter22").expect("hashing should succeed");
        assert!(verify_password("hunter22", &hash).expect("verify should succeed"));
        assert!(!verify_password("hunter23", &hash).expect("verify should succeed"));
    }
}
