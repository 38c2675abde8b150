//! Account credentials: password hashing and bearer tokens.
//!
//! Passwords are stored as Argon2id PHC strings. Logged-in clients receive an
//! HS256 JWT which they present as `Authorization: Bearer <token>`; handlers
//! take an [`AuthUser`] argument to require one.

use std::sync::Arc;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::api::AppError;
use crate::state::AppState;

/// Errors from credential handling.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Password hashing failed: {0}")]
    Hash(String),
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Check a password against a stored hash.
///
/// A malformed stored hash is an error; a wrong password is `Ok(false)`.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Bearer token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    pub username: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Issues and verifies HS256 bearer tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    /// Create an issuer with a random per-process secret.
    pub fn ephemeral(ttl_secs: u64) -> Self {
        let secret = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self::new(&secret, ttl_secs)
    }

    /// Issue a token for an account.
    pub fn issue(&self, account_id: i64, username: &str) -> Result<String, AuthError> {
        let iat = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: account_id.to_string(),
            username: username.to_string(),
            iat,
            exp: iat + self.ttl_secs as i64,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Verify a token's signature and expiry and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        Ok(data.claims)
    }
}

/// The account making an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub account_id: i64,
    pub username: String,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;

        let claims = state.tokens.verify(token).map_err(|e| {
            debug!("Rejected bearer token: {}", e);
            AppError::Unauthorized("Invalid or expired token".to_string())
        })?;

        let account_id = claims.sub.parse::<i64>().map_err(|_| {
            debug!("Rejected bearer token with subject {:?}", claims.sub);
            AppError::Unauthorized("Invalid or expired token".to_string())
        })?;

        Ok(AuthUser {
            account_id,
            username: claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password_is_salted() {
        let hash1 = hash_password("same-password").unwrap();
        let hash2 = hash_password("same-password").unwrap();

        assert!(hash1.starts_with("$argon2"));
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_verify_password() {
        let hash = hash_password("correct-password").unwrap();

        assert!(verify_password("correct-password", &hash).unwrap());
        assert!(!verify_password("wrong-password", &hash).unwrap());
    }

    #[test]
    fn test_verify_password_invalid_hash() {
        let result = verify_password("any-password", "invalid-hash");
        assert!(matches!(result, Err(AuthError::Hash(_))));
    }

    #[test]
    fn test_issue_and_verify_token() {
        let issuer = TokenIssuer::new("test-secret-key-0123", 3600);
        let token = issuer.issue(7, "farmer").unwrap();

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.username, "farmer");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let issuer = TokenIssuer::new("test-secret-key-0123", 3600);
        let other = TokenIssuer::new("different-secret-key", 3600);
        let token = issuer.issue(7, "farmer").unwrap();

        assert!(matches!(other.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_verify_rejects_expired() {
        let issuer = TokenIssuer::new("test-secret-key-0123", 3600);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: "7".to_string(),
            username: "farmer".to_string(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(&Header::default(), &claims, &issuer.encoding).unwrap();

        assert!(matches!(issuer.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let issuer = TokenIssuer::ephemeral(60);
        assert!(issuer.verify("not-a-token").is_err());
    }
}
