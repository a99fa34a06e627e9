//! End-to-end tests for the access layer.
//!
//! These wire CSRF, the rate limiter and API keys to one SQLite database and
//! drive them both directly and through the axum middleware.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::routing::post;
use axum::{middleware, Extension, Router};
use chrono::{TimeDelta, TimeZone, Utc};
use tower::ServiceExt;

use household_access::{
    access_control_middleware, AccessConfig, AccessControl, AccessError, AuthSource,
    AuthorizationContext, Clock, Database, InboundRequest, ManualClock, MemorySession, NewApiKey,
    SessionHandle, SessionStore,
};

fn setup() -> (Arc<AccessControl>, ManualClock) {
    setup_with(AccessConfig::default())
}

fn setup_with(config: AccessConfig) -> (Arc<AccessControl>, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 10, 18, 40, 0).unwrap());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let access = AccessControl::with_database(config, db, Arc::new(clock.clone()));
    (Arc::new(access), clock)
}

fn key_request(owner: i64, quota: u32) -> NewApiKey {
    NewApiKey {
        owner_user_id: owner,
        name: "Bank export".into(),
        scopes: vec!["read".into(), "write".into()],
        hourly_quota: quota,
        expires_at: None,
    }
}

async fn echo(Extension(ctx): Extension<AuthorizationContext>, body: String) -> String {
    format!(
        "{}:{:?}:{}",
        ctx.principal_id.map(|id| id.to_string()).unwrap_or_default(),
        ctx.source,
        body
    )
}

fn app(access: Arc<AccessControl>, session: Arc<MemorySession>) -> Router {
    Router::new()
        .route("/transactions", post(echo).get(echo))
        .layer(middleware::from_fn_with_state(access, access_control_middleware))
        .layer(Extension(SessionHandle::new(session)))
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =========================================================================
// CSRF: issue → submit → rotate → stale token rejected
// =========================================================================

#[test]
fn csrf_token_stops_working_after_rotation() {
    let (access, _clock) = setup();
    let session = MemorySession::new();
    session.set("user_id", "12".into());
    let headers = HeaderMap::new();

    let token = access.csrf(&session).current();

    let first = access.evaluate(&InboundRequest {
        method: &Method::POST,
        headers: &headers,
        body_token: Some(token.as_str()),
        session: Some(&session),
    });
    let ctx = first.into_result().unwrap();
    assert_eq!(ctx.principal_id, Some(12));
    assert_eq!(ctx.source, AuthSource::Session);

    // Login/logout rotates the token.
    access.csrf(&session).rotate();

    let replay = access.evaluate(&InboundRequest {
        method: &Method::POST,
        headers: &headers,
        body_token: Some(token.as_str()),
        session: Some(&session),
    });
    let err = replay.into_result().unwrap_err();
    assert!(matches!(err, AccessError::InvalidCsrfToken));
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    assert_eq!(err.body()["error"], "Invalid or missing CSRF token");
}

// =========================================================================
// Rate limiter presets
// =========================================================================

#[test]
fn sixth_login_attempt_gets_429_with_retry_after() {
    let (access, _clock) = setup();
    let limiter = access.rate_limiter();

    for _ in 0..5 {
        limiter.enforce_login("alice@example.com", "1.2.3.4").unwrap();
    }
    let err = limiter
        .enforce_login("alice@example.com", "1.2.3.4")
        .unwrap_err();

    assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err.retry_after(), Some(900));
    assert_eq!(err.body()["message"], "Too many attempts. Please try again in 15 minutes.");

    let resp = axum::response::IntoResponse::into_response(err);
    assert_eq!(resp.headers()[header::RETRY_AFTER], "900");

    // Another address for the same account has its own budget.
    assert!(limiter.enforce_login("alice@example.com", "5.6.7.8").is_ok());
}

#[test]
fn successful_login_clears_failures() {
    let (access, _clock) = setup();
    let limiter = access.rate_limiter();

    for _ in 0..5 {
        limiter.enforce_login("bob@example.com", "9.9.9.9").unwrap();
    }
    assert!(limiter.enforce_login("bob@example.com", "9.9.9.9").is_err());

    assert_eq!(limiter.reset_login("bob@example.com", "9.9.9.9").unwrap(), 5);
    assert!(limiter.enforce_login("bob@example.com", "9.9.9.9").is_ok());
}

#[test]
fn login_window_slides() {
    let (access, clock) = setup();
    let limiter = access.rate_limiter();

    for _ in 0..5 {
        limiter.enforce_login("carol@example.com", "1.1.1.1").unwrap();
        clock.advance_secs(60);
    }
    // First attempt was 300s ago; it leaves the 900s window 600s from now.
    assert!(limiter.enforce_login("carol@example.com", "1.1.1.1").is_err());
    clock.advance_secs(600);
    assert!(limiter.enforce_login("carol@example.com", "1.1.1.1").is_ok());
    assert!(limiter.enforce_login("carol@example.com", "1.1.1.1").is_err());
}

// =========================================================================
// API keys
// =========================================================================

#[test]
fn rejected_keys_share_one_response_shape() {
    let (access, clock) = setup();
    let auth = access.authenticator();

    let (revoked, revoked_secret) = auth.issue(key_request(1, 10)).unwrap();
    auth.revoke(&revoked.id).unwrap();

    let (_, expired_secret) = auth
        .issue(NewApiKey {
            expires_at: Some(clock.now() + TimeDelta::seconds(30)),
            ..key_request(1, 10)
        })
        .unwrap();
    clock.advance_secs(30);

    let responses: Vec<_> = [
        "hak_ZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZ".to_string(),
        revoked_secret,
        expired_secret,
    ]
    .iter()
    .map(|secret| auth.authenticate_secret(secret).unwrap_err())
    .map(|err| (err.status(), err.body()))
    .collect();

    assert_eq!(responses[0].0, StatusCode::UNAUTHORIZED);
    assert!(responses.iter().all(|r| *r == responses[0]));
}

#[test]
fn quota_exhausts_then_refills_next_hour() {
    let (access, clock) = setup();
    let auth = access.authenticator();
    let (_, secret) = auth.issue(key_request(4, 2)).unwrap();

    assert!(auth.authenticate_secret(&secret).is_ok());
    assert!(auth.authenticate_secret(&secret).is_ok());
    let err = auth.authenticate_secret(&secret).unwrap_err();
    assert!(matches!(err, AccessError::QuotaExceeded { .. }));
    // 18:40 -> 19:00
    assert_eq!(err.retry_after(), Some(20 * 60));

    clock.advance(TimeDelta::minutes(20));
    assert!(auth.authenticate_secret(&secret).is_ok());
}

#[test]
fn maintenance_prunes_past_quota_buckets() {
    let (access, clock) = setup();
    let auth = access.authenticator();
    let (key, secret) = auth.issue(key_request(6, 10)).unwrap();

    // One request an hour for two days.
    for _ in 0..48 {
        auth.authenticate_secret(&secret).unwrap();
        clock.advance(TimeDelta::hours(1));
    }

    assert_eq!(auth.cleanup_hour_windows().unwrap(), 48);
    assert_eq!(auth.cleanup_hour_windows().unwrap(), 0);

    // The current hour's quota is untouched by cleanup.
    auth.authenticate_secret(&secret).unwrap();
    assert_eq!(auth.hourly_usage(&key.id).unwrap(), 1);
    assert_eq!(auth.cleanup_hour_windows().unwrap(), 0);
}

#[test]
fn rotation_invalidates_old_secret() {
    let (access, _clock) = setup();
    let auth = access.authenticator();
    let (old, old_secret) = auth.issue(key_request(8, 50)).unwrap();

    let (new, new_secret) = auth.rotate(&old.id).unwrap();
    assert_ne!(new_secret, old_secret);
    assert_eq!(new.scopes, old.scopes);
    assert_eq!(new.hourly_quota, 50);

    assert!(matches!(
        auth.authenticate_secret(&old_secret),
        Err(AccessError::InvalidCredential)
    ));
    let ctx = auth.authenticate_secret(&new_secret).unwrap();
    assert!(ctx.validate_scope("write"));
    assert!(!ctx.validate_scope("admin"));
    assert_eq!(ctx.require_permission("admin").unwrap_err().status(), StatusCode::FORBIDDEN);

    let keys = auth.list_for_owner(8).unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys.iter().filter(|k| k.is_active).count(), 1);
}

#[test]
fn keys_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = AccessConfig {
        database_path: dir.path().join("access.db"),
        ..AccessConfig::default()
    };

    let secret = {
        let access = AccessControl::open(config.clone()).unwrap();
        access.authenticator().issue(key_request(2, 10)).unwrap().1
    };

    let access = AccessControl::open(config).unwrap();
    let ctx = access.authenticator().authenticate_secret(&secret).unwrap();
    assert_eq!(ctx.principal_id, Some(2));
}

// =========================================================================
// axum middleware
// =========================================================================

#[tokio::test]
async fn form_post_with_token_reaches_handler_with_body_intact() {
    let (access, _clock) = setup();
    let session = Arc::new(MemorySession::new());
    session.set("user_id", "5".into());
    let token = access.csrf(session.as_ref()).current();

    let form = format!("amount=42.00&csrf_token={}", token);
    let resp = app(access.clone(), session.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form.clone()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, format!("5:Session:{}", form));
}

#[tokio::test]
async fn header_token_accepted_for_json_posts() {
    let (access, _clock) = setup();
    let session = Arc::new(MemorySession::new());
    let token = access.csrf(session.as_ref()).current();

    let resp = app(access, session)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-csrf-token", token)
                .body(Body::from(r#"{"amount": 3}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn post_without_token_is_403_json() {
    let (access, _clock) = setup();
    let session = Arc::new(MemorySession::new());
    access.csrf(session.as_ref()).current();

    let resp = app(access, session)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("amount=1"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["code"], "invalid_csrf_token");
}

#[tokio::test]
async fn api_key_requests_skip_csrf_and_carry_context() {
    let (access, _clock) = setup();
    let (_, secret) = access.authenticator().issue(key_request(77, 1)).unwrap();
    let session = Arc::new(MemorySession::new());

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/transactions")
            .header("x-api-key", secret.as_str())
            .body(Body::from("payload"))
            .unwrap()
    };

    let resp = app(access.clone(), session.clone())
        .oneshot(request())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "77:ApiKey:payload");

    let resp = app(access, session).oneshot(request()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()[header::RETRY_AFTER], "1200");
    let body = body_json(resp).await;
    assert_eq!(body["code"], "quota_exceeded");
    assert_eq!(body["retry_after"], 1200);
}

#[tokio::test]
async fn unknown_key_is_401() {
    let (access, _clock) = setup();
    let resp = app(access, Arc::new(MemorySession::new()))
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/transactions")
                .header(header::AUTHORIZATION, "Bearer hak_doesnotexist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["code"], "invalid_credential");
}

#[tokio::test]
async fn oversized_form_body_is_413() {
    let (access, _clock) = setup_with(AccessConfig {
        max_body_bytes: 64,
        ..AccessConfig::default()
    });
    let session = Arc::new(MemorySession::new());
    let token = access.csrf(session.as_ref()).current();
    let form = format!("note={}&csrf_token={}", "x".repeat(200), token);

    // Without Content-Length the limit trips while reading.
    let resp = app(access.clone(), session.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // A declared length over the limit is refused before reading.
    let resp = app(access, session)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(header::CONTENT_LENGTH, form.len())
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn body_cut_off_mid_stream_is_400() {
    let (access, _clock) = setup();
    let session = Arc::new(MemorySession::new());
    access.csrf(session.as_ref()).current();

    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(b"amount=5&csrf_")),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "client went away",
        )),
    ];
    let resp = app(access, session)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from_stream(futures_util::stream::iter(chunks)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
