//! End-to-end flow through the HTTP router: anti-forgery handshake, login,
//! refresh, logout, revoke-all and login lockout.

use arena_guard::{
    auth::{router, CredentialVerifier, SecurityState, StaticCredentials},
    AttemptLimiterConfig, ManualClock, SecurityConfig, TokenServiceConfig,
};
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const USERNAME: &str = "croupier";
const PASSWORD: &str = "hunter2!";

struct Harness {
    app: Router,
    state: SecurityState,
    clock: ManualClock,
}

/// Browser-side session: the two cookies plus the token the page would read.
struct Session {
    session_cookie: String,
    csrf_token: String,
}

impl Session {
    fn cookie_header(&self) -> String {
        format!("{}; XSRF-TOKEN={}", self.session_cookie, self.csrf_token)
    }
}

fn harness() -> Harness {
    let clock = ManualClock::starting_now();
    let mut config = SecurityConfig::new(TokenServiceConfig::new(
        "integration-secret",
        Duration::from_secs(15 * 60),
        Duration::from_secs(7 * 24 * 3600),
    ));
    config.attempts = AttemptLimiterConfig {
        max_attempts: 5,
        ..AttemptLimiterConfig::default()
    };

    let verifier: Arc<dyn CredentialVerifier> =
        Arc::new(StaticCredentials::new(USERNAME, PASSWORD, "admin"));
    let state = SecurityState::spawn(config, clock.shared(), verifier).unwrap();
    let app = router(state.clone()).layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 51000))));

    Harness { app, state, clock }
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_cookie(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{name}=")))
        .map(|v| v.to_string())
}

async fn open_session(app: &Router) -> Session {
    let response = send(
        app,
        Request::get("/api/csrf").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let session = set_cookie(&response, "arena.sid").expect("session cookie");
    assert!(session.contains("HttpOnly"));
    let xsrf = set_cookie(&response, "XSRF-TOKEN").expect("csrf cookie");
    assert!(!xsrf.contains("HttpOnly"));

    let session_cookie = session.split(';').next().unwrap().to_string();
    let body = json_body(response).await;
    let csrf_token = body["csrf_token"].as_str().unwrap().to_string();
    assert!(xsrf.starts_with(&format!("XSRF-TOKEN={csrf_token}")));

    Session {
        session_cookie,
        csrf_token,
    }
}

fn post_json(uri: &str, session: &Session, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, session.cookie_header())
        .header("x-csrf-token", &session.csrf_token)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn login(app: &Router, session: &Session) -> Value {
    let response = send(
        app,
        post_json(
            "/api/auth/login",
            session,
            json!({ "username": USERNAME, "password": PASSWORD }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn test_mutation_without_csrf_header_is_forbidden() {
    let h = harness();
    let session = open_session(&h.app).await;

    let request = Request::post("/api/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, session.cookie_header())
        .body(Body::from(
            json!({ "username": USERNAME, "password": PASSWORD }).to_string(),
        ))
        .unwrap();
    let response = send(&h.app, request).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "csrf_validation_failed");

    let mut forged = post_json(
        "/api/auth/login",
        &session,
        json!({ "username": USERNAME, "password": PASSWORD }),
    );
    forged
        .headers_mut()
        .insert("x-csrf-token", "not-the-token".parse().unwrap());
    assert_eq!(send(&h.app, forged).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_login_refresh_and_logout() {
    let h = harness();
    let session = open_session(&h.app).await;

    let tokens = login(&h.app, &session).await;
    assert_eq!(tokens["token_type"], "Bearer");
    let access = tokens["access_token"].as_str().unwrap().to_string();
    let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let claims = h.state.tokens.verify(&access).unwrap();
    assert_eq!(claims.principal_id(), Some("user:croupier"));
    assert_eq!(claims.get("role").and_then(|v| v.as_str()), Some("admin"));

    // a refresh credential is not accepted as a bearer
    let mut wrong_type = post_json("/api/auth/logout", &session, json!({}));
    wrong_type
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {refresh}").parse().unwrap());
    assert_eq!(send(&h.app, wrong_type).await.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &h.app,
        post_json("/api/auth/refresh", &session, json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let renewed = json_body(response).await;
    let new_access = renewed["access_token"].as_str().unwrap().to_string();
    let new_refresh = renewed["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(new_access, access);

    // the spent refresh credential is gone
    assert!(h.state.tokens.is_revoked(&refresh));
    let replay = send(
        &h.app,
        post_json("/api/auth/refresh", &session, json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(replay).await["error"], "token_revoked");

    let mut logout = post_json(
        "/api/auth/logout",
        &session,
        json!({ "refresh_token": new_refresh }),
    );
    logout
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {new_access}").parse().unwrap());
    assert_eq!(send(&h.app, logout).await.status(), StatusCode::NO_CONTENT);

    assert!(h.state.tokens.is_revoked(&new_access));
    assert!(h.state.tokens.is_revoked(&new_refresh));
}

#[tokio::test]
async fn test_expired_access_credential_is_rejected() {
    let h = harness();
    let session = open_session(&h.app).await;
    let tokens = login(&h.app, &session).await;
    let access = tokens["access_token"].as_str().unwrap();

    h.clock.advance(Duration::from_secs(15 * 60));

    let mut request = post_json("/api/auth/logout", &session, json!({}));
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {access}").parse().unwrap());
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "token_expired");
}

#[tokio::test]
async fn test_revoke_all_for_caller() {
    let h = harness();
    let session = open_session(&h.app).await;

    let first = login(&h.app, &session).await;
    let second = login(&h.app, &session).await;
    let access = first["access_token"].as_str().unwrap().to_string();

    let mut request = post_json("/api/auth/revoke-all", &session, json!({}));
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {access}").parse().unwrap());
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["revoked"], 4);

    for pair in [&first, &second] {
        for key in ["access_token", "refresh_token"] {
            let credential = pair[key].as_str().unwrap();
            assert!(h.state.tokens.is_revoked(credential), "{key} still valid");
        }
    }
}

#[tokio::test]
async fn test_repeated_failed_logins_are_blocked() {
    let h = harness();
    let session = open_session(&h.app).await;
    let bad = json!({ "username": USERNAME, "password": "guess" });

    for _ in 0..5 {
        let response = send(&h.app, post_json("/api/auth/login", &session, bad.clone())).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = send(&h.app, post_json("/api/auth/login", &session, bad)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("Retry-After"));
    let body = json_body(response).await;
    assert_eq!(body["error"], "too_many_attempts");
    assert!(body["blocked_until"].is_string());

    // correct password does not get through while blocked
    let response = send(
        &h.app,
        post_json(
            "/api/auth/login",
            &session,
            json!({ "username": USERNAME, "password": PASSWORD }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // block lapses with the clock
    h.clock.advance(Duration::from_secs(15 * 60 + 1));
    login(&h.app, &session).await;
    assert_eq!(h.state.limiter.stats().blocked, 0);
}

#[tokio::test]
async fn test_shutdown_clears_state() {
    let h = harness();
    let session = open_session(&h.app).await;
    login(&h.app, &session).await;
    assert!(!h.state.csrf.is_empty());

    h.state.shutdown();
    assert!(h.state.csrf.is_empty());
    assert_eq!(h.state.tokens.stats().principals, 0);
    assert_eq!(h.state.limiter.stats().tracking, 0);
}
