//! Authentication API Endpoints
//! Mission: Wire login, refresh, logout and anti-forgery tokens into HTTP routes
//!
//! Mapping: verification failures → 401, attempt blocks → 429 with
//! `blocked_until`, anti-forgery failures → 403 (from the CSRF middleware).

use crate::auth::{
    jwt::TokenService,
    middleware::{auth_middleware, AuthError, BearerToken},
    models::{Claims, CredentialPair},
    user_store::CredentialVerifier,
};
use crate::config::SecurityConfig;
use crate::clock::SharedClock;
use crate::error::TokenError;
use crate::middleware::{
    attempt_limit::{attempt_limit_middleware, blocked_response, ip_key, AttemptLimiter, LimitDecision},
    csrf::{csrf_middleware, CsrfToken, CsrfTokenStore},
};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared security state
#[derive(Clone)]
pub struct SecurityState {
    pub tokens: Arc<TokenService>,
    pub limiter: Arc<AttemptLimiter>,
    pub csrf: Arc<CsrfTokenStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
}

impl SecurityState {
    /// Build all three components with their reclamation tasks running.
    pub fn spawn(
        config: SecurityConfig,
        clock: SharedClock,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Self, TokenError> {
        Ok(Self {
            tokens: TokenService::spawn(config.tokens, clock.clone())?,
            limiter: AttemptLimiter::spawn(config.attempts, clock.clone()),
            csrf: CsrfTokenStore::spawn(config.csrf, clock),
            verifier,
        })
    }

    /// Stop every reclamation task and clear all state.
    pub fn shutdown(&self) {
        self.tokens.shutdown();
        self.limiter.shutdown();
        self.csrf.shutdown();
        info!("Security components shut down");
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

/// Credential pair as returned to clients
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

impl From<CredentialPair> for TokenResponse {
    fn from(pair: CredentialPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: pair.expires_at,
            token_type: "Bearer".to_string(),
        }
    }
}

/// API error
#[derive(Debug)]
pub enum ApiError {
    InvalidCredentials,
    MissingPrincipal,
    Blocked(LimitDecision, DateTime<Utc>),
    Auth(AuthError),
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        ApiError::Auth(AuthError::Token(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid_credentials", "message": "Invalid username or password" })),
            )
                .into_response(),
            ApiError::MissingPrincipal => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "missing_principal", "message": "Token carries no principal id" })),
            )
                .into_response(),
            ApiError::Blocked(decision, now) => blocked_response(&decision, now),
            ApiError::Auth(err) => err.into_response(),
        }
    }
}

/// Login endpoint - POST /api/auth/login
///
/// Runs behind [`attempt_limit_middleware`], so the attempt is already counted.
pub async fn login(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<SecurityState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Some(principal) = state.verifier.verify(&payload.username, &payload.password).await else {
        warn!(username = %payload.username, ip = %addr.ip(), "Failed login attempt");
        return Err(ApiError::InvalidCredentials);
    };

    state.limiter.record_successful_attempt(&ip_key(&addr));
    let pair = state.tokens.issue_credentials(principal.claims, &principal.id)?;

    info!(principal = %principal.id, "Login successful");
    Ok(Json(pair.into()))
}

/// Refresh endpoint - POST /api/auth/refresh
///
/// The spent refresh credential is revoked, so each one can be exchanged once.
pub async fn refresh(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<SecurityState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let key = ip_key(&addr);
    if let Some(decision) = state.limiter.blocked_decision(&key) {
        return Err(ApiError::Blocked(decision, state.limiter.now()));
    }

    match state.tokens.redeem_refresh_credentials(&payload.refresh_token) {
        Ok(pair) => Ok(Json(pair.into())),
        Err(err) => {
            state.limiter.record_failed_attempt(&key);
            warn!(ip = %addr.ip(), reason = err.code(), "Refresh rejected");
            Err(err.into())
        }
    }
}

/// Logout endpoint - POST /api/auth/logout
pub async fn logout(
    State(state): State<SecurityState>,
    Extension(BearerToken(access)): Extension<BearerToken>,
    body: Option<Json<LogoutRequest>>,
) -> StatusCode {
    state.tokens.revoke(&access);
    if let Some(refresh) = body.and_then(|Json(b)| b.refresh_token) {
        state.tokens.revoke(&refresh);
    }
    StatusCode::NO_CONTENT
}

/// Revoke every credential of the caller - POST /api/auth/revoke-all
pub async fn revoke_all(
    State(state): State<SecurityState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = claims.principal_id().ok_or(ApiError::MissingPrincipal)?;
    let revoked = state.tokens.revoke_all_for_principal(principal);
    Ok(Json(json!({ "revoked": revoked })))
}

/// Anti-forgery token for the session - GET /api/csrf
pub async fn csrf_token(Extension(CsrfToken(token)): Extension<CsrfToken>) -> Json<serde_json::Value> {
    Json(json!({ "csrf_token": token }))
}

/// All security routes. Serve with `into_make_service_with_connect_info`.
pub fn router(state: SecurityState) -> Router {
    let login_routes = Router::new()
        .route("/api/auth/login", post(login))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            attempt_limit_middleware,
        ));

    let protected = Router::new()
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/revoke-all", post(revoke_all))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/api/auth/refresh", post(refresh))
        .route("/api/csrf", get(csrf_token))
        .merge(login_routes)
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.csrf.clone(),
            csrf_middleware,
        ))
        .with_state(state)
}
