//! Arena Guard
//!
//! Security primitives for the arena backend: signed session credentials with
//! refresh and revocation, login attempt limiting, and per-session
//! anti-forgery tokens. Each component keeps its own time-bounded in-memory
//! state behind a mutex and reclaims expired entries on a background task.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod reclaim;

pub use auth::{SecurityState, TokenService};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AttemptLimiterConfig, CsrfConfig, SecurityConfig, TokenServiceConfig};
pub use error::{ConfigError, TokenError};
pub use middleware::{AttemptLimiter, CsrfTokenStore};
