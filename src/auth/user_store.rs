//! Credential verification seam
//! Mission: Let the login endpoint check passwords without owning user storage
//!
//! Password scoring and persistent user storage live outside this crate; the
//! login endpoint only needs something that maps a username/password to a
//! principal.

use crate::auth::models::{Claims, ID_CLAIM};
use crate::middleware::csrf::constant_time_eq;
use async_trait::async_trait;
use std::env;
use std::fmt;

/// Principal recovered from a successful password check.
#[derive(Debug, Clone)]
pub struct VerifiedPrincipal {
    pub id: String,
    /// Claims to embed in the access credential
    pub claims: Claims,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    async fn verify(&self, username: &str, password: &str) -> Option<VerifiedPrincipal>;
}

/// Single operator account, typically configured from env.
pub struct StaticCredentials {
    username: String,
    password: String,
    role: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("username", &self.username)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            role: role.into(),
        }
    }

    /// `ARENA_OPERATOR_USERNAME` / `ARENA_OPERATOR_PASSWORD`; None if unset.
    pub fn from_env() -> Option<Self> {
        let username = env::var("ARENA_OPERATOR_USERNAME").ok()?;
        let password = env::var("ARENA_OPERATOR_PASSWORD").ok()?;
        if username.is_empty() || password.is_empty() {
            return None;
        }
        let role = env::var("ARENA_OPERATOR_ROLE").unwrap_or_else(|_| "operator".to_string());
        Some(Self::new(username, password, role))
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, username: &str, password: &str) -> Option<VerifiedPrincipal> {
        // evaluate both so timing does not reveal which one matched
        let user_ok = constant_time_eq(&self.username, username);
        let pass_ok = constant_time_eq(&self.password, password);
        if !(user_ok & pass_ok) {
            return None;
        }

        let id = format!("user:{}", self.username);
        Some(VerifiedPrincipal {
            claims: Claims::new()
                .with(ID_CLAIM, id.as_str())
                .with("username", self.username.as_str())
                .with("role", self.role.as_str()),
            id,
        })
    }
}

/// Rejects everything. Used when no operator account is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl CredentialVerifier for DenyAll {
    async fn verify(&self, _username: &str, _password: &str) -> Option<VerifiedPrincipal> {
        None
    }
}
