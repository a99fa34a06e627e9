use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{AccessError, AccessResult};

/// Universal override: a context holding this permission passes every check.
pub const ADMIN_PERMISSION: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    Session,
    ApiKey,
}

/// Coarse external-facing scope labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Read,
    Write,
    Admin,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Scope::Read),
            "write" => Some(Scope::Write),
            "admin" => Some(Scope::Admin),
            _ => None,
        }
    }

    /// Permissions any one of which satisfies the scope.
    pub fn permissions(&self) -> &'static [&'static str] {
        match self {
            Scope::Read => &["read", "write", "admin"],
            Scope::Write => &["write", "admin"],
            Scope::Admin => &["admin"],
        }
    }
}

/// Who is making the request and what they may do. Built fresh for every
/// accepted request and attached to it as an extension; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationContext {
    /// Signed-in user (session) or key owner (API key). `None` for anonymous
    /// browser sessions.
    pub principal_id: Option<i64>,
    pub permissions: BTreeSet<String>,
    pub rate_limit_ceiling: u32,
    pub source: AuthSource,
    /// Set when `source` is `ApiKey`.
    pub api_key_id: Option<String>,
}

impl AuthorizationContext {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission) || self.permissions.contains(ADMIN_PERMISSION)
    }

    pub fn require_permission(&self, permission: &str) -> AccessResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            log::warn!(
                "AUDIT DENIED principal={:?} source={:?} reason=missing_permission permission={}",
                self.principal_id,
                self.source,
                permission
            );
            Err(AccessError::InsufficientPermission(permission.to_string()))
        }
    }

    /// Unknown scope names fail closed.
    pub fn validate_scope(&self, scope: &str) -> bool {
        Scope::parse(scope)
            .map(|s| s.permissions().iter().any(|p| self.has_permission(p)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(perms: &[&str]) -> AuthorizationContext {
        AuthorizationContext {
            principal_id: Some(1),
            permissions: perms.iter().map(|p| p.to_string()).collect(),
            rate_limit_ceiling: 100,
            source: AuthSource::ApiKey,
            api_key_id: Some("k1".into()),
        }
    }

    #[test]
    fn explicit_permission() {
        let c = ctx(&["read"]);
        assert!(c.has_permission("read"));
        assert!(!c.has_permission("write"));
    }

    #[test]
    fn admin_grants_everything() {
        let c = ctx(&["admin"]);
        assert!(c.has_permission("read"));
        assert!(c.has_permission("budgets:delete"));
        assert!(c.require_permission("anything-at-all").is_ok());
    }

    #[test]
    fn require_permission_rejects_with_403() {
        let err = ctx(&["read"]).require_permission("write").unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
        assert!(matches!(err, AccessError::InsufficientPermission(p) if p == "write"));
    }

    #[test]
    fn scope_hierarchy() {
        let read = ctx(&["read"]);
        let write = ctx(&["write"]);
        let admin = ctx(&["admin"]);

        assert!(read.validate_scope("read"));
        assert!(!read.validate_scope("write"));
        assert!(!read.validate_scope("admin"));

        assert!(write.validate_scope("read"));
        assert!(write.validate_scope("write"));
        assert!(!write.validate_scope("admin"));

        assert!(admin.validate_scope("read"));
        assert!(admin.validate_scope("write"));
        assert!(admin.validate_scope("admin"));
    }

    #[test]
    fn unknown_scope_fails_closed() {
        assert!(!ctx(&["admin"]).validate_scope("superuser"));
        assert!(!ctx(&["read"]).validate_scope(""));
    }
}
