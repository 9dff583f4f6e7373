//! Authentication Module
//! Mission: Signed session credentials with refresh, revocation and HTTP wiring

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod user_store;

pub use api::{router, SecurityState};
pub use jwt::{TokenReclaimed, TokenService, TokenStats};
pub use middleware::{auth_middleware, AuthError};
pub use models::{Claims, CredentialPair, CredentialType};
pub use user_store::{CredentialVerifier, DenyAll, StaticCredentials, VerifiedPrincipal};
