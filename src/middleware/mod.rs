//! Request-path security middleware.
//!
//! This module provides:
//! - Login attempt limiting with temporary blocks per client
//! - Double-submit anti-forgery (CSRF) tokens per session

pub mod attempt_limit;
pub mod csrf;

pub use attempt_limit::{attempt_limit_middleware, AttemptLimiter, LimitDecision, LimiterStats};
pub use csrf::{csrf_middleware, CsrfToken, CsrfTokenStore, SessionId};
