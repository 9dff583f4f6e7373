//! Authentication Middleware
//! Mission: Protect API endpoints with access credential verification

use crate::auth::{
    jwt::TokenService,
    models::{Claims, CredentialType},
};
use crate::error::TokenError;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Raw bearer credential of the authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

/// Bearer credential from the `Authorization` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Auth middleware that verifies access credentials
pub async fn auth_middleware(
    State(tokens): State<Arc<TokenService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    // Websocket clients cannot set headers: accept ?token=... as well
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|t| t.to_string())
    });

    let token = bearer_from_headers(req.headers())
        .or(token_from_query)
        .ok_or(AuthError::MissingToken)?;

    let claims = tokens.verify(&token)?;
    let found = claims.credential_type();
    if found != Some(CredentialType::Access) {
        return Err(AuthError::Token(TokenError::WrongCredentialType {
            expected: CredentialType::Access,
            found,
        }));
    }

    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(BearerToken(token));

    Ok(next.run(req).await)
}

/// Extract claims from request (use after auth middleware)
pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

/// Auth error types
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    Token(TokenError),
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        AuthError::Token(err)
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AuthError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "missing_token",
                "Missing authorization token. Use: Bearer {token}",
            ),
            AuthError::Token(err) => match err {
                TokenError::Malformed => (StatusCode::UNAUTHORIZED, err.code(), "Invalid token"),
                TokenError::Expired => (StatusCode::UNAUTHORIZED, err.code(), "Token has expired"),
                TokenError::Revoked => (StatusCode::UNAUTHORIZED, err.code(), "Token has been revoked"),
                TokenError::WrongCredentialType { .. } => {
                    (StatusCode::UNAUTHORIZED, err.code(), "Wrong token type")
                }
                TokenError::InvalidCredential => (StatusCode::BAD_REQUEST, err.code(), "Invalid token"),
                TokenError::Configuration(_) | TokenError::Signing(_) | TokenError::NoRuntime => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error",
                ),
            },
        };

        let body = serde_json::json!({ "error": code, "message": message });
        (status, axum::Json(body)).into_response()
    }
}
