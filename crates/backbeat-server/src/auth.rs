//! Handshake authentication.
//!
//! Every WebSocket upgrade must present a platform-issued token, either
//! as a `token` query parameter or an `Authorization: Bearer` header.
//! Validation happens before the upgrade so a bad credential is refused
//! with a plain HTTP 401 instead of an open-then-closed socket.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identity established by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Why a handshake was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the query string or the Authorization header.
    #[error("missing credentials")]
    MissingCredentials,

    /// The token was valid once but its expiry has passed.
    #[error("token expired")]
    Expired,

    /// Bad signature, malformed token, or missing claims.
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Credential validation behind the upgrade gate.
///
/// The bundled [`JwtAuthenticator`] verifies platform tokens locally;
/// deployments that delegate to an account service implement this trait
/// instead.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate a raw token and resolve the identity behind it.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing why the credential was
    /// refused.
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Claims carried by platform access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,

    /// Display name. Falls back to the user id when absent.
    #[serde(default)]
    pub username: Option<String>,

    /// Expiry as Unix seconds.
    pub exp: i64,
}

/// HS256 verifier for platform-issued tokens.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let data =
            decode::<Claims>(token, &self.key, &self.validation).map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(err.to_string()),
            })?;

        let claims = data.claims;
        let username = claims.username.unwrap_or_else(|| claims.user_id.clone());
        Ok(Identity {
            user_id: claims.user_id,
            username,
        })
    }
}

/// Extract the credential from an upgrade request. The `token` query
/// parameter wins over the `Authorization: Bearer` header.
#[must_use]
pub fn bearer_token(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.get("token") {
        if !token.is_empty() {
            return Some(token.clone());
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}
