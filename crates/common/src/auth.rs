//! Bearer token verification.
//!
//! The relay's WebSocket handshake and any HTTP-facing producer middleware
//! call [`verify_token`] independently with the same shared secret. Tokens are
//! HS256 JWTs whose subject is the user's opaque ID.

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;
use crate::types::UserId;

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject, the user's ID. Tokens minted by the legacy auth service
    /// carry it as `userId`.
    #[serde(alias = "userId")]
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    #[serde(default)]
    pub iat: i64,
}

/// Why a credential was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("No token provided")]
    MissingCredential,

    #[error("Invalid token: {0}")]
    InvalidCredential(String),
}

/// Encode a JWT token for a user.
pub fn encode_token(user_id: &UserId, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to encode JWT: {}", e)))
}

/// Decode and validate a JWT token, returning its claims.
pub fn decode_claims(token: &str, secret: &str) -> Result<Claims, TokenError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| TokenError::InvalidCredential(e.to_string()))?;

    Ok(token_data.claims)
}

/// Verify a bearer credential and extract the user it was issued to.
///
/// Accepts the raw token or an `Authorization` header value with a
/// `Bearer ` prefix. Absent or blank input is `MissingCredential`; anything
/// that fails signature, expiry or subject parsing is `InvalidCredential`.
pub fn verify_token(token: Option<&str>, secret: &str) -> Result<UserId, TokenError> {
    let token = token
        .map(str::trim)
        .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).trim())
        .filter(|t| !t.is_empty())
        .ok_or(TokenError::MissingCredential)?;

    let claims = decode_claims(token, secret)?;

    UserId::new(claims.sub)
        .map_err(|_| TokenError::InvalidCredential("Invalid user ID in token".to_string()))
}
