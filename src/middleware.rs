use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;

use crate::api_keys::{extract_credential, ApiKeyAuthenticator, SqliteApiKeyStore};
use crate::clock::{Clock, SystemClock};
use crate::config::AccessConfig;
use crate::context::{AuthSource, AuthorizationContext};
use crate::csrf::{is_safe_method, CsrfProtection};
use crate::db::Database;
use crate::error::{AccessError, StoreResult};
use crate::rate_limit::{self, RateLimiter, SqliteAttemptStore};
use crate::session::{SessionHandle, SessionStore};

/// What the access layer needs to know about one inbound request.
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    /// CSRF field from a parsed form or JSON body, if any.
    pub body_token: Option<&'a str>,
    pub session: Option<&'a dyn SessionStore>,
}

/// Outcome of gating a request. The caller writes the response.
#[derive(Debug)]
pub enum Decision {
    Allow(AuthorizationContext),
    Reject(AccessError),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    pub fn into_result(self) -> Result<AuthorizationContext, AccessError> {
        match self {
            Decision::Allow(ctx) => Ok(ctx),
            Decision::Reject(err) => Err(err),
        }
    }
}

/// Composition root: CSRF for browser sessions, API keys for programmatic
/// clients, and the shared rate limiter for handlers that need presets.
pub struct AccessControl {
    config: AccessConfig,
    authenticator: ApiKeyAuthenticator,
    rate_limiter: RateLimiter,
}

impl AccessControl {
    pub fn new(
        config: AccessConfig,
        authenticator: ApiKeyAuthenticator,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            config,
            authenticator,
            rate_limiter,
        }
    }

    /// Wire every component to one SQLite database.
    pub fn with_database(config: AccessConfig, db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        let authenticator = ApiKeyAuthenticator::new(
            Arc::new(SqliteApiKeyStore::new(db.clone())),
            clock.clone(),
        );
        let rate_limiter =
            RateLimiter::from_config(Arc::new(SqliteAttemptStore::new(db)), clock, &config);
        Self::new(config, authenticator, rate_limiter)
    }

    /// Open the configured database on the wall clock.
    pub fn open(config: AccessConfig) -> StoreResult<Self> {
        let db = Arc::new(Database::open(&config.database_path)?);
        log::info!("Access store opened at {}", config.database_path.display());
        Ok(Self::with_database(config, db, Arc::new(SystemClock)))
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &ApiKeyAuthenticator {
        &self.authenticator
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// CSRF protection bound to one session.
    pub fn csrf<S: SessionStore>(&self, session: S) -> CsrfProtection<S> {
        CsrfProtection::with_settings(session, self.config.csrf.clone())
    }

    /// Client address for rate-limit keys, honoring only the configured proxy headers.
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        rate_limit::client_ip(headers, peer, &self.config.trusted_proxy_headers)
    }

    /// Gate one request. An API credential selects the key path regardless of
    /// method; everything else is a browser session subject to CSRF checks.
    pub fn evaluate(&self, req: &InboundRequest<'_>) -> Decision {
        if let Some(secret) = extract_credential(req.headers) {
            return match self.authenticator.authenticate_secret(&secret) {
                Ok(ctx) => Decision::Allow(ctx),
                Err(e) => Decision::Reject(e),
            };
        }

        let Some(session) = req.session else {
            if is_safe_method(req.method) {
                return Decision::Allow(self.anonymous_context());
            }
            log::warn!("AUDIT DENIED method={} reason=csrf_no_session", req.method);
            return Decision::Reject(AccessError::InvalidCsrfToken);
        };

        if let Err(e) = self
            .csrf(session)
            .enforce(req.method, req.headers, req.body_token)
        {
            return Decision::Reject(e);
        }

        Decision::Allow(self.session_context(session))
    }

    fn anonymous_context(&self) -> AuthorizationContext {
        AuthorizationContext {
            principal_id: None,
            permissions: BTreeSet::new(),
            rate_limit_ceiling: self.config.session_rate_ceiling,
            source: AuthSource::Session,
            api_key_id: None,
        }
    }

    fn session_context(&self, session: &dyn SessionStore) -> AuthorizationContext {
        let principal_id = session
            .get(&self.config.session_user_key)
            .and_then(|v| v.trim().parse::<i64>().ok());

        match principal_id {
            Some(id) => AuthorizationContext {
                principal_id: Some(id),
                permissions: self.config.session_permissions.iter().cloned().collect(),
                rate_limit_ceiling: self.config.session_rate_ceiling,
                source: AuthSource::Session,
                api_key_id: None,
            },
            None => self.anonymous_context(),
        }
    }
}

fn body_token(content_type: Option<&str>, body: &[u8], field: &str) -> Option<String> {
    let mime = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "application/x-www-form-urlencoded" => url::form_urlencoded::parse(body)
            .find(|(k, _)| k == field)
            .map(|(_, v)| v.into_owned()),
        "application/json" => serde_json::from_slice::<serde_json::Value>(body)
            .ok()?
            .get(field)?
            .as_str()
            .map(str::to_string),
        _ => None,
    }
}

fn carries_parseable_body(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/x-www-form-urlencoded") || ct.starts_with("application/json")
        })
        .unwrap_or(false)
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// True when a body read failed because it ran past the buffering limit, as
/// opposed to the client or transport breaking mid-stream.
fn exceeded_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Axum middleware for `axum::middleware::from_fn_with_state`.
///
/// The host's session layer must run first and insert a [`SessionHandle`].
/// State-changing browser requests with a form or JSON body are buffered (up
/// to `max_body_bytes`) so the CSRF field can be read, then handed downstream
/// unchanged. Bodies over the limit get 413; bodies that fail to arrive get
/// 400. On success the [`AuthorizationContext`] is inserted as a request
/// extension.
pub async fn access_control_middleware(
    State(access): State<Arc<AccessControl>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let session = parts.extensions.get::<SessionHandle>().cloned();

    let wants_body_token = !is_safe_method(&method)
        && extract_credential(&parts.headers).is_none()
        && carries_parseable_body(&parts.headers);

    let (body, token) = if wants_body_token {
        if declared_length(&parts.headers).is_some_and(|len| len > access.config.max_body_bytes) {
            log::warn!(
                "AUDIT DENIED method={} path={} reason=body_too_large limit={}",
                method,
                path,
                access.config.max_body_bytes
            );
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        let bytes = match axum::body::to_bytes(body, access.config.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let (status, reason) = if exceeded_length_limit(&e) {
                    (StatusCode::PAYLOAD_TOO_LARGE, "body_too_large")
                } else {
                    (StatusCode::BAD_REQUEST, "body_unreadable")
                };
                log::warn!(
                    "AUDIT DENIED method={} path={} reason={} error={}",
                    method,
                    path,
                    reason,
                    e
                );
                return status.into_response();
            }
        };
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let token = body_token(content_type, &bytes, &access.config.csrf.field_name);
        (Body::from(bytes), token)
    } else {
        (body, None)
    };

    let decision = access.evaluate(&InboundRequest {
        method: &method,
        headers: &parts.headers,
        body_token: token.as_deref(),
        session: session.as_ref().map(|s| s.0.as_ref()),
    });

    let ctx = match decision {
        Decision::Allow(ctx) => ctx,
        Decision::Reject(err) => {
            let peer = parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            log::warn!(
                "AUDIT DENIED method={} path={} ip={} code={}",
                method,
                path,
                access.client_ip(&parts.headers, peer),
                err.code()
            );
            return err.into_response();
        }
    };

    let principal = ctx
        .principal_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "anonymous".to_string());
    let source = ctx.source;

    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(ctx);

    let response = next.run(req).await;

    log::info!(
        "AUDIT principal={} source={:?} method={} path={} status={}",
        principal,
        source,
        method,
        path,
        response.status().as_u16()
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_keys::NewApiKey;
    use crate::clock::ManualClock;
    use crate::session::MemorySession;
    use axum::http::HeaderValue;
    use chrono::{TimeZone, Utc};

    fn access() -> AccessControl {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        AccessControl::with_database(
            AccessConfig::default(),
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(clock),
        )
    }

    fn request<'a>(
        method: &'a Method,
        headers: &'a HeaderMap,
        body_token: Option<&'a str>,
        session: Option<&'a dyn SessionStore>,
    ) -> InboundRequest<'a> {
        InboundRequest {
            method,
            headers,
            body_token,
            session,
        }
    }

    #[test]
    fn safe_method_allowed_without_token() {
        let access = access();
        let session = MemorySession::new();
        session.set("user_id", "7".into());
        let headers = HeaderMap::new();

        let ctx = access
            .evaluate(&request(&Method::GET, &headers, None, Some(&session)))
            .into_result()
            .unwrap();
        assert_eq!(ctx.principal_id, Some(7));
        assert_eq!(ctx.source, AuthSource::Session);
        assert!(ctx.has_permission("write"));
        assert_eq!(ctx.rate_limit_ceiling, 100);
    }

    #[test]
    fn post_needs_matching_token() {
        let access = access();
        let session = MemorySession::new();
        let headers = HeaderMap::new();
        let token = access.csrf(&session).issue();

        let missing = access.evaluate(&request(&Method::POST, &headers, None, Some(&session)));
        assert!(matches!(missing, Decision::Reject(AccessError::InvalidCsrfToken)));

        let ok = access.evaluate(&request(&Method::POST, &headers, Some(token.as_str()), Some(&session)));
        assert!(ok.is_allowed());
    }

    #[test]
    fn anonymous_session_gets_no_permissions() {
        let access = access();
        let session = MemorySession::new();
        let headers = HeaderMap::new();
        let ctx = access
            .evaluate(&request(&Method::GET, &headers, None, Some(&session)))
            .into_result()
            .unwrap();
        assert_eq!(ctx.principal_id, None);
        assert!(ctx.permissions.is_empty());
    }

    #[test]
    fn unsafe_method_without_session_is_rejected() {
        let access = access();
        let headers = HeaderMap::new();
        let decision = access.evaluate(&request(&Method::DELETE, &headers, None, None));
        assert!(matches!(decision, Decision::Reject(AccessError::InvalidCsrfToken)));
    }

    #[test]
    fn api_key_bypasses_csrf() {
        let access = access();
        let (_, raw) = access
            .authenticator()
            .issue(NewApiKey {
                owner_user_id: 3,
                name: "Importer".into(),
                scopes: vec!["write".into()],
                hourly_quota: 5,
                expires_at: None,
            })
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", raw)).unwrap(),
        );
        let ctx = access
            .evaluate(&request(&Method::POST, &headers, None, None))
            .into_result()
            .unwrap();
        assert_eq!(ctx.source, AuthSource::ApiKey);
        assert_eq!(ctx.principal_id, Some(3));
    }

    #[test]
    fn bad_api_key_does_not_fall_back_to_session() {
        let access = access();
        let session = MemorySession::new();
        session.set("user_id", "7".into());
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("hak_nope"));

        let decision = access.evaluate(&request(&Method::GET, &headers, None, Some(&session)));
        assert!(matches!(decision, Decision::Reject(AccessError::InvalidCredential)));
    }

    #[test]
    fn body_token_from_form_and_json() {
        assert_eq!(
            body_token(
                Some("application/x-www-form-urlencoded; charset=utf-8"),
                b"amount=12.50&csrf_token=abc%2Bdef",
                "csrf_token"
            ),
            Some("abc+def".to_string())
        );
        assert_eq!(
            body_token(Some("application/json"), br#"{"csrf_token":"xyz"}"#, "csrf_token"),
            Some("xyz".to_string())
        );
        assert_eq!(body_token(Some("text/plain"), b"csrf_token=abc", "csrf_token"), None);
        assert_eq!(body_token(None, b"csrf_token=abc", "csrf_token"), None);
        assert_eq!(body_token(Some("application/json"), b"not json", "csrf_token"), None);
    }
}
