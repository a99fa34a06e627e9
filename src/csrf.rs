//! Session-bound synchronizer tokens against cross-site request forgery.
//!
//! Each session holds exactly one live token. Browsers echo it back either in
//! the `csrf_token` form field or the `X-CSRF-Token` header (script reads it
//! from the `<meta name="csrf-token">` tag). The value stored in the session is
//! the only one ever considered valid; submitted values are compared in
//! constant time and never written anywhere.

use axum::http::{HeaderMap, Method};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use subtle::ConstantTimeEq;

use crate::config::CsrfSettings;
use crate::error::{AccessError, AccessResult};
use crate::session::SessionStore;

/// Random bytes per token (256 bits).
const TOKEN_BYTES: usize = 32;

fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// GET, HEAD and OPTIONS never change state. Every other method, including
/// ones we don't recognise, must carry a token.
pub fn is_safe_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

pub struct CsrfProtection<S: SessionStore> {
    session: S,
    settings: CsrfSettings,
}

impl<S: SessionStore> CsrfProtection<S> {
    pub fn new(session: S) -> Self {
        Self::with_settings(session, CsrfSettings::default())
    }

    pub fn with_settings(session: S, settings: CsrfSettings) -> Self {
        CsrfProtection { session, settings }
    }

    /// Generate a fresh token, replacing whatever the session held.
    pub fn issue(&self) -> String {
        let token = generate_token();
        self.session.set(&self.settings.session_key, token.clone());
        token
    }

    /// The session's live token, issuing one on first use.
    pub fn current(&self) -> String {
        match self.session.get(&self.settings.session_key) {
            Some(token) if !token.is_empty() => token,
            _ => self.issue(),
        }
    }

    /// Constant-time check of a submitted token against the session's.
    pub fn validate(&self, submitted: &str) -> bool {
        if submitted.is_empty() {
            return false;
        }
        let Some(expected) = self.session.get(&self.settings.session_key) else {
            return false;
        };
        if expected.is_empty() {
            return false;
        }
        expected.as_bytes().ct_eq(submitted.as_bytes()).into()
    }

    /// Discard the current token and issue a new one. Call on every login and
    /// logout so a pre-authentication token can't be replayed.
    pub fn rotate(&self) -> String {
        self.session.delete(&self.settings.session_key);
        self.issue()
    }

    /// Gate a request. `body_token` is the form/JSON field, if the caller
    /// already parsed the body; the header is consulted when it is absent.
    pub fn enforce(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body_token: Option<&str>,
    ) -> AccessResult<()> {
        if is_safe_method(method) {
            return Ok(());
        }

        let submitted = body_token.filter(|t| !t.is_empty()).or_else(|| {
            headers
                .get(self.settings.header_name.as_str())
                .and_then(|v| v.to_str().ok())
        });

        match submitted {
            Some(token) if self.validate(token) => Ok(()),
            _ => {
                log::warn!("AUDIT DENIED method={} reason=csrf", method);
                Err(AccessError::InvalidCsrfToken)
            }
        }
    }

    /// `<meta>` tag exposing the token to page scripts.
    pub fn meta_tag(&self) -> String {
        format!(r#"<meta name="csrf-token" content="{}">"#, self.current())
    }

    /// Hidden input for server-rendered forms.
    pub fn hidden_field(&self) -> String {
        format!(
            r#"<input type="hidden" name="{}" value="{}">"#,
            self.settings.field_name,
            self.current()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use axum::http::HeaderValue;

    fn protection() -> CsrfProtection<MemorySession> {
        CsrfProtection::new(MemorySession::new())
    }

    #[test]
    fn issued_token_validates() {
        let csrf = protection();
        let token = csrf.issue();
        assert!(csrf.validate(&token));
    }

    #[test]
    fn token_has_256_bits() {
        let token = protection().issue();
        let decoded = URL_SAFE_NO_PAD.decode(&token).unwrap();
        assert_eq!(decoded.len(), TOKEN_BYTES);
    }

    #[test]
    fn last_byte_difference_is_rejected() {
        let csrf = protection();
        let token = csrf.issue();

        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });

        assert!(!csrf.validate(&tampered));
        assert!(!csrf.validate(&token[..token.len() - 1]));
        assert!(!csrf.validate(&format!("{}x", token)));
    }

    #[test]
    fn empty_and_missing_are_rejected() {
        let csrf = protection();
        assert!(!csrf.validate("anything"));
        assert!(!csrf.validate(""));

        csrf.issue();
        assert!(!csrf.validate(""));
    }

    #[test]
    fn current_is_stable_until_rotated() {
        let csrf = protection();
        let first = csrf.current();
        assert_eq!(csrf.current(), first);

        let rotated = csrf.rotate();
        assert_ne!(rotated, first);
        assert!(!csrf.validate(&first));
        assert!(csrf.validate(&rotated));
    }

    #[test]
    fn issue_overwrites_previous_token() {
        let csrf = protection();
        let old = csrf.issue();
        let new = csrf.issue();
        assert!(!csrf.validate(&old));
        assert!(csrf.validate(&new));
    }

    #[test]
    fn safe_methods_skip_enforcement() {
        let csrf = protection();
        let headers = HeaderMap::new();
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(csrf.enforce(&method, &headers, None).is_ok());
        }
    }

    #[test]
    fn state_changing_methods_need_token() {
        let csrf = protection();
        let token = csrf.issue();
        let empty = HeaderMap::new();

        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert!(matches!(
                csrf.enforce(&method, &empty, None),
                Err(AccessError::InvalidCsrfToken)
            ));
            assert!(csrf.enforce(&method, &empty, Some(token.as_str())).is_ok());
        }
    }

    #[test]
    fn header_carrier_is_accepted() {
        let csrf = protection();
        let token = csrf.issue();
        let mut headers = HeaderMap::new();
        headers.insert("x-csrf-token", HeaderValue::from_str(&token).unwrap());
        assert!(csrf.enforce(&Method::POST, &headers, None).is_ok());
    }

    #[test]
    fn mismatched_body_token_does_not_fall_back_to_header() {
        let csrf = protection();
        let token = csrf.issue();
        let mut headers = HeaderMap::new();
        headers.insert("x-csrf-token", HeaderValue::from_str(&token).unwrap());
        assert!(csrf
            .enforce(&Method::POST, &headers, Some("forged"))
            .is_err());
    }

    #[test]
    fn carriers_render_current_token() {
        let csrf = protection();
        let token = csrf.current();
        assert_eq!(
            csrf.meta_tag(),
            format!(r#"<meta name="csrf-token" content="{}">"#, token)
        );
        assert!(csrf.hidden_field().contains(r#"name="csrf_token""#));
        assert!(csrf.hidden_field().contains(&token));
    }
}
