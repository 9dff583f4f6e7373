//! Anti-forgery (CSRF) token store and double-submit middleware.
//!
//! Each browser session gets a random token, delivered in a script-readable
//! cookie and echoed back in a request header on mutating requests.
//! Comparison is constant-time.

use crate::clock::{span, SharedClock};
use crate::config::CsrfConfig;
use crate::reclaim::Reclaimer;
use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderName, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

struct CsrfEntry {
    token: String,
    issued_at: DateTime<Utc>,
}

/// Token handed to request handlers by [`csrf_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(pub String);

/// Session the middleware resolved for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Equality whose running time does not depend on where the inputs differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Per-session anti-forgery token store.
pub struct CsrfTokenStore {
    config: CsrfConfig,
    header_name: HeaderName,
    clock: SharedClock,
    tokens: Mutex<HashMap<String, CsrfEntry>>,
    reclaimer: Reclaimer,
}

impl std::fmt::Debug for CsrfTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfTokenStore")
            .field("config", &self.config)
            .field("sessions", &self.len())
            .finish()
    }
}

impl CsrfTokenStore {
    pub fn new(config: CsrfConfig, clock: SharedClock) -> Self {
        if config.token_length < config.token_bytes() {
            warn!(
                configured = config.token_length,
                effective = config.token_bytes(),
                "CSRF token length below entropy floor, raising"
            );
        }
        let header_name = config
            .header_name
            .parse()
            .unwrap_or_else(|_| HeaderName::from_static("x-csrf-token"));

        Self {
            config,
            header_name,
            clock,
            tokens: Mutex::new(HashMap::new()),
            reclaimer: Reclaimer::new(),
        }
    }

    /// Create a store and start its reclamation task.
    pub fn spawn(config: CsrfConfig, clock: SharedClock) -> Arc<Self> {
        let store = Arc::new(Self::new(config, clock));
        store.reclaimer.start(
            "csrf-store",
            store.config.cleanup_interval(),
            &store,
            |s: &CsrfTokenStore| {
                s.reclaim();
            },
        );
        store
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Fresh URL-safe token from the OS CSPRNG.
    pub fn generate_token(&self) -> String {
        let mut bytes = vec![0u8; self.config.token_bytes()];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(&bytes)
    }

    /// Associate `token` with the session, replacing any previous one.
    pub fn store_token(&self, session_id: &str, token: &str) {
        let issued_at = self.clock.now();
        self.tokens.lock().insert(
            session_id.to_string(),
            CsrfEntry {
                token: token.to_string(),
                issued_at,
            },
        );
    }

    pub fn generate_and_store(&self, session_id: &str) -> String {
        let token = self.generate_token();
        self.store_token(session_id, &token);
        token
    }

    /// Stored token, even if expired. Expiry is enforced by `validate_token`.
    pub fn get_token(&self, session_id: &str) -> Option<String> {
        self.tokens.lock().get(session_id).map(|e| e.token.clone())
    }

    /// Current token if still valid, otherwise a newly stored one.
    pub fn ensure_token(&self, session_id: &str) -> String {
        let now = self.clock.now();
        let mut tokens = self.tokens.lock();
        if let Some(entry) = tokens.get(session_id) {
            if !self.is_expired(entry, now) {
                return entry.token.clone();
            }
        }

        let token = self.generate_token();
        tokens.insert(
            session_id.to_string(),
            CsrfEntry {
                token: token.clone(),
                issued_at: now,
            },
        );
        debug!(session = %session_id, "Issued CSRF token");
        token
    }

    fn is_expired(&self, entry: &CsrfEntry, now: DateTime<Utc>) -> bool {
        now - entry.issued_at > span(self.config.token_expiration())
    }

    /// Fails closed on missing, expired or mismatched tokens.
    pub fn validate_token(&self, session_id: &str, candidate: &str) -> bool {
        let now = self.clock.now();
        let (stored, expired) = {
            let tokens = self.tokens.lock();
            let Some(entry) = tokens.get(session_id) else {
                return false;
            };
            (entry.token.clone(), self.is_expired(entry, now))
        };

        let matches = constant_time_eq(&stored, candidate);
        matches && !expired
    }

    pub fn invalidate_token(&self, session_id: &str) -> bool {
        self.tokens.lock().remove(session_id).is_some()
    }

    pub fn invalidate_all_tokens(&self) {
        self.tokens.lock().clear();
    }

    /// Replace the token of a known session. Unknown sessions get nothing.
    pub fn refresh_token(&self, session_id: &str) -> Option<String> {
        let now = self.clock.now();
        let mut tokens = self.tokens.lock();
        let entry = tokens.get_mut(session_id)?;
        entry.token = self.generate_token();
        entry.issued_at = now;
        Some(entry.token.clone())
    }

    /// Drop expired entries. Returns how many went.
    pub fn reclaim(&self) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.lock();
        let before = tokens.len();
        tokens.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(removed, "Reclaimed expired CSRF tokens");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop reclamation and clear all tokens. Idempotent.
    pub fn shutdown(&self) {
        self.reclaimer.stop();
        self.invalidate_all_tokens();
    }
}

fn is_safe_method(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE].contains(method)
}

fn is_https<B>(request: &Request<B>) -> bool {
    request.uri().scheme_str() == Some("https")
        || request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

fn forbidden() -> Response {
    let body = serde_json::json!({
        "error": "csrf_validation_failed",
        "message": "Missing or invalid CSRF token",
    });
    (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
}

/// Double-submit CSRF middleware.
///
/// Resolves (or mints) the session, validates the header token on mutating
/// requests before the handler runs, then makes sure the session has a token,
/// sets it as a script-readable cookie and exposes it as [`CsrfToken`].
pub async fn csrf_middleware(
    State(store): State<Arc<CsrfTokenStore>>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let config = store.config();
    let secure = is_https(&request);

    let existing = jar
        .get(&config.session_cookie_name)
        .map(|cookie| cookie.value().to_string());

    let (session_id, jar) = match existing {
        Some(session_id) => (session_id, jar),
        None => {
            let session_id = Uuid::new_v4().to_string();
            let cookie = Cookie::build((config.session_cookie_name.clone(), session_id.clone()))
                .http_only(true)
                .same_site(SameSite::Strict)
                .secure(secure)
                .path("/");
            (session_id, jar.add(cookie))
        }
    };

    if !is_safe_method(request.method()) {
        let candidate = request
            .headers()
            .get(&store.header_name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !store.validate_token(&session_id, candidate) {
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                "CSRF validation failed"
            );
            return forbidden();
        }
    }

    let token = store.ensure_token(&session_id);
    let cookie = Cookie::build((config.cookie_name.clone(), token.clone()))
        .http_only(false)
        .same_site(SameSite::Strict)
        .secure(secure)
        .path("/");
    let jar = jar.add(cookie);

    request.extensions_mut().insert(CsrfToken(token));
    request.extensions_mut().insert(SessionId(session_id));

    (jar, next.run(request).await).into_response()
}
