//! Error taxonomy for the security layer.
//!
//! Limiter and anti-forgery decisions are ordinary return values, so only
//! configuration and credential handling have error types.

use crate::auth::models::CredentialType;
use thiserror::Error;

/// Invalid or missing configuration. Raised at construction, never recovered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors surfaced by [`crate::auth::TokenService`].
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Bad signature or undecodable credential.
    #[error("credential is malformed or has an invalid signature")]
    Malformed,

    #[error("credential has expired")]
    Expired,

    #[error("credential has been revoked")]
    Revoked,

    #[error("expected a {expected} credential, got {}", .found.map(|t| t.as_str()).unwrap_or("untyped"))]
    WrongCredentialType {
        expected: CredentialType,
        found: Option<CredentialType>,
    },

    /// Credential could not be decoded for scheduling (no readable `exp`).
    #[error("credential cannot be decoded or carries no expiry")]
    InvalidCredential,

    #[error("failed to sign credential: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("auto-refresh requires a running tokio runtime")]
    NoRuntime,
}

impl TokenError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::Configuration(_) => "configuration_error",
            TokenError::Malformed => "malformed_token",
            TokenError::Expired => "token_expired",
            TokenError::Revoked => "token_revoked",
            TokenError::WrongCredentialType { .. } => "wrong_token_type",
            TokenError::InvalidCredential => "invalid_token",
            TokenError::Signing(_) => "signing_failed",
            TokenError::NoRuntime => "no_runtime",
        }
    }
}
