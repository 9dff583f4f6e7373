//! Security layer configuration
//!
//! Loaded from a TOML file (`[tokens]`, `[attempts]`, `[csrf]` tables) or from
//! environment variables. The signing secret and credential lifetimes have no
//! defaults; everything else does.

use crate::error::ConfigError;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Env var naming an optional TOML config file.
pub const CONFIG_PATH_VAR: &str = "ARENA_SECURITY_CONFIG";
pub const JWT_SECRET_VAR: &str = "ARENA_JWT_SECRET";
pub const JWT_ALGORITHM_VAR: &str = "ARENA_JWT_ALGORITHM";
pub const ACCESS_TTL_VAR: &str = "ARENA_ACCESS_TOKEN_TTL_SECS";
pub const REFRESH_TTL_VAR: &str = "ARENA_REFRESH_TOKEN_TTL_SECS";

/// Longest credential lifetime or auto-refresh lead time (10 years).
pub const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Longest attempt window or block (1 year).
pub const MAX_LIMITER_SPAN_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Smallest anti-forgery token, in bytes of entropy.
pub const MIN_CSRF_TOKEN_BYTES: usize = 32;

/// Top-level configuration for all three components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub tokens: TokenServiceConfig,

    #[serde(default)]
    pub attempts: AttemptLimiterConfig,

    #[serde(default)]
    pub csrf: CsrfConfig,
}

impl SecurityConfig {
    pub fn new(tokens: TokenServiceConfig) -> Self {
        Self {
            tokens,
            attempts: AttemptLimiterConfig::default(),
            csrf: CsrfConfig::default(),
        }
    }

    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file, letting `ARENA_JWT_SECRET` override the file's
    /// secret. The file may omit the secret when the env var is set.
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_secret();
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `ARENA_SECURITY_CONFIG`, or assemble the config
    /// from individual env vars. `ARENA_JWT_SECRET` always wins over a secret
    /// found in a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                tracing::debug!(path = %path, "Loading security config file");
                Self::load_with_env(&path)
            }
            Err(_) => {
                let config = Self::new(TokenServiceConfig::from_env()?);
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn apply_env_secret(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_VAR) {
            self.tokens.secret = secret;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tokens.validate()?;
        self.attempts.validate()?;
        self.csrf.validate()
    }
}

fn default_algorithm() -> Algorithm {
    Algorithm::HS256
}

fn default_refresh_threshold_secs() -> u64 {
    300
}

fn default_token_cleanup_secs() -> u64 {
    3600
}

/// Credential issuance settings. No `Default`: the secret and both
/// lifetimes must be supplied.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenServiceConfig {
    /// HMAC signing key
    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Access credential lifetime (seconds)
    pub access_expiry_secs: u64,

    /// Refresh credential lifetime (seconds)
    pub refresh_expiry_secs: u64,

    /// Lead time before expiry at which auto-refresh fires (seconds)
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,

    /// Blacklist / principal index reclamation cadence (seconds)
    #[serde(default = "default_token_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

impl fmt::Debug for TokenServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenServiceConfig")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("access_expiry_secs", &self.access_expiry_secs)
            .field("refresh_expiry_secs", &self.refresh_expiry_secs)
            .field("refresh_threshold_secs", &self.refresh_threshold_secs)
            .field("cleanup_interval_secs", &self.cleanup_interval_secs)
            .finish()
    }
}

impl TokenServiceConfig {
    pub fn new(secret: impl Into<String>, access_expiry: Duration, refresh_expiry: Duration) -> Self {
        Self {
            secret: secret.into(),
            algorithm: default_algorithm(),
            access_expiry_secs: access_expiry.as_secs(),
            refresh_expiry_secs: refresh_expiry.as_secs(),
            refresh_threshold_secs: default_refresh_threshold_secs(),
            cleanup_interval_secs: default_token_cleanup_secs(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Build from `ARENA_JWT_*` / `ARENA_*_TOKEN_TTL_SECS` env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var(JWT_SECRET_VAR).map_err(|_| ConfigError::Missing(JWT_SECRET_VAR))?;
        let access = required_secs(ACCESS_TTL_VAR)?;
        let refresh = required_secs(REFRESH_TTL_VAR)?;

        let mut config = Self::new(secret, access, refresh);
        if let Ok(raw) = std::env::var(JWT_ALGORITHM_VAR) {
            config.algorithm = raw.parse().map_err(|_| ConfigError::Invalid {
                key: JWT_ALGORITHM_VAR,
                reason: format!("unknown algorithm {raw:?}"),
            })?;
        }
        Ok(config)
    }

    pub fn access_expiry(&self) -> Duration {
        Duration::from_secs(self.access_expiry_secs)
    }

    pub fn refresh_expiry(&self) -> Duration {
        Duration::from_secs(self.refresh_expiry_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.trim().is_empty() {
            return Err(ConfigError::Missing("tokens.secret"));
        }
        if !matches!(
            self.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(ConfigError::Invalid {
                key: "tokens.algorithm",
                reason: format!("{:?} is not a shared-secret algorithm", self.algorithm),
            });
        }
        for (key, secs) in [
            ("tokens.access_expiry_secs", self.access_expiry_secs),
            ("tokens.refresh_expiry_secs", self.refresh_expiry_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
            if secs > MAX_TOKEN_TTL_SECS {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("must not exceed {MAX_TOKEN_TTL_SECS}"),
                });
            }
        }
        if self.refresh_threshold_secs > MAX_TOKEN_TTL_SECS {
            return Err(ConfigError::Invalid {
                key: "tokens.refresh_threshold_secs",
                reason: format!("must not exceed {MAX_TOKEN_TTL_SECS}"),
            });
        }
        Ok(())
    }
}

fn required_secs(var: &'static str) -> Result<Duration, ConfigError> {
    let raw = std::env::var(var).map_err(|_| ConfigError::Missing(var))?;
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::Invalid {
            key: var,
            reason: e.to_string(),
        })
}

/// Login attempt limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptLimiterConfig {
    /// Attempts allowed per window; the next one blocks
    pub max_attempts: u32,
    /// Window length (ms)
    pub window_ms: u64,
    /// Block length (ms)
    pub block_duration_ms: u64,
    /// Reclamation cadence (ms)
    pub cleanup_interval_ms: u64,
}

impl Default for AttemptLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_ms: 15 * 60 * 1000,
            block_duration_ms: 15 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
        }
    }
}

impl AttemptLimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "attempts.max_attempts",
                reason: "must allow at least one attempt".into(),
            });
        }
        for (key, ms) in [
            ("attempts.window_ms", self.window_ms),
            ("attempts.block_duration_ms", self.block_duration_ms),
        ] {
            if ms > MAX_LIMITER_SPAN_MS {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("must not exceed {MAX_LIMITER_SPAN_MS}"),
                });
            }
        }
        Ok(())
    }
}

/// Anti-forgery token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Bytes of entropy per token (raised to 32 if lower)
    pub token_length: usize,
    /// Token lifetime (ms)
    pub token_expiration_ms: u64,
    /// Response cookie carrying the token
    pub cookie_name: String,
    /// Request header echoing the token on mutating requests
    pub header_name: String,
    /// Cookie identifying the browser session
    pub session_cookie_name: String,
    /// Reclamation cadence (ms)
    pub cleanup_interval_ms: u64,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_length: MIN_CSRF_TOKEN_BYTES,
            token_expiration_ms: 60 * 60 * 1000,
            cookie_name: "XSRF-TOKEN".into(),
            header_name: "x-csrf-token".into(),
            session_cookie_name: "arena.sid".into(),
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl CsrfConfig {
    pub fn token_expiration(&self) -> Duration {
        Duration::from_millis(self.token_expiration_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Effective entropy per token.
    pub fn token_bytes(&self) -> usize {
        self.token_length.max(MIN_CSRF_TOKEN_BYTES)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.header_name.parse::<axum::http::HeaderName>().is_err() {
            return Err(ConfigError::Invalid {
                key: "csrf.header_name",
                reason: format!("{:?} is not a valid header name", self.header_name),
            });
        }
        if self.cookie_name.trim().is_empty() || self.session_cookie_name.trim().is_empty() {
            return Err(ConfigError::Missing("csrf.cookie_name"));
        }
        Ok(())
    }
}
