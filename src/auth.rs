//! Shared-secret authentication.

use crate::config::AuthConfig;
use crate::error::{AppError, Result};
use crate::server::AppState;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

/// Header carrying the shared secret.
pub const PASSWORD_HEADER: &str = "x-app-password";

/// Argon2 PHC string for `auth.password_hash`, as printed by `hash-password`.
pub fn hash_password(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|phc| phc.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash shared secret: {}", e)))
}

/// Check a presented secret against the configured PHC string.
///
/// A malformed PHC string is a configuration error, not a mismatch.
pub fn verify_password(presented: &str, phc: &str) -> Result<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| AppError::Config(format!("auth.password_hash is not a PHC string: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(presented.as_bytes(), &parsed)
        .is_ok())
}

/// Compare without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
enum Secret {
    Plain(String),
    Hashed(String),
}

/// The single secret every API client must present.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Option<Secret>,
}

impl SharedSecret {
    /// Build from config; a hash takes precedence over a plaintext password.
    ///
    /// A malformed hash is a startup error.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let hash = config.password_hash.as_deref().map(str::trim).filter(|h| !h.is_empty());
        let plain = config.password.as_deref().map(str::trim).filter(|p| !p.is_empty());

        let secret = match (hash, plain) {
            (Some(hash), _) => {
                PasswordHash::new(hash)
                    .map_err(|e| AppError::Config(format!("Invalid auth.password_hash: {}", e)))?;
                Some(Secret::Hashed(hash.to_string()))
            }
            (None, Some(plain)) => Some(Secret::Plain(plain.to_string())),
            (None, None) => None,
        };

        Ok(Self { secret })
    }

    /// A secret that accepts exactly `password`.
    pub fn plain(password: &str) -> Self {
        Self {
            secret: Some(Secret::Plain(password.to_string())),
        }
    }

    /// Whether any secret is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Whether `provided` matches. Always false when unconfigured.
    pub fn matches(&self, provided: &str) -> bool {
        match &self.secret {
            Some(Secret::Plain(expected)) => {
                constant_time_eq(provided.as_bytes(), expected.as_bytes())
            }
            Some(Secret::Hashed(hash)) => verify_password(provided, hash).unwrap_or(false),
            None => false,
        }
    }

    /// Check the password header of a request.
    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        if !self.is_configured() {
            return Err(AppError::Misconfigured(
                "APP_PASSWORD environment variable is not set".to_string(),
            ));
        }

        let provided = provided_password(headers);
        if provided.is_empty() {
            return Err(AppError::Unauthorized("Authentication required".to_string()));
        }

        if !self.matches(provided) {
            return Err(AppError::Unauthorized("Invalid password".to_string()));
        }

        Ok(())
    }
}

/// Trimmed `X-App-Password` value, empty when absent or not UTF-8.
pub fn provided_password(headers: &HeaderMap) -> &str {
    headers
        .get(PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
}

/// Middleware guarding the API routes.
pub async fn require_password(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    state.secret.check(request.headers())?;
    Ok(next.run(request).await)
}
