use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::auth::VerifiedCredential;
use crate::errors::GatewayError;
use crate::metrics;

pub const READ_CONTROLS: &str = "read:controls";
pub const WRITE_CONTROLS: &str = "write:controls";
pub const READ_POLICIES: &str = "read:policies";
pub const WRITE_POLICIES: &str = "write:policies";

/// Immutable set of scopes granted to an authenticated caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeSet(Arc<BTreeSet<String>>);

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(scopes.into_iter().map(Into::into).collect()))
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Maps a verified credential to the scopes it carries.
pub trait ScopeResolver: Send + Sync {
    fn resolve(&self, credential: &VerifiedCredential) -> ScopeSet;
}

/// Grants the same scopes to every caller holding the shared token.
#[derive(Clone, Debug)]
pub struct StaticScopeResolver {
    scopes: ScopeSet,
}

impl StaticScopeResolver {
    pub fn new(scopes: ScopeSet) -> Self {
        Self { scopes }
    }
}

impl Default for StaticScopeResolver {
    fn default() -> Self {
        Self::new(default_token_scopes())
    }
}

impl ScopeResolver for StaticScopeResolver {
    fn resolve(&self, _credential: &VerifiedCredential) -> ScopeSet {
        self.scopes.clone()
    }
}

pub fn default_token_scopes() -> ScopeSet {
    ScopeSet::new([READ_CONTROLS, WRITE_CONTROLS, READ_POLICIES, WRITE_POLICIES])
}

pub fn check_scope(granted: Option<&ScopeSet>, required: &str) -> Result<(), GatewayError> {
    match granted {
        None => Err(GatewayError::MissingScopes),
        Some(scopes) if scopes.is_empty() => Err(GatewayError::MissingScopes),
        Some(scopes) if scopes.contains(required) => Ok(()),
        Some(_) => Err(GatewayError::InsufficientScope {
            required: required.to_string(),
        }),
    }
}

/// Middleware state for a single protected route group.
#[derive(Clone, Copy, Debug)]
pub struct ScopeGate {
    pub required: &'static str,
    pub bypass: bool,
}

pub async fn require_scope(
    State(gate): State<ScopeGate>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if gate.bypass {
        return next.run(req).await;
    }
    let granted = req
        .extensions()
        .get::<VerifiedCredential>()
        .map(VerifiedCredential::scopes);
    match check_scope(granted, gate.required) {
        Ok(()) => next.run(req).await,
        Err(err) => {
            debug!(required = gate.required, path = %req.uri().path(), "scope check rejected request");
            metrics::record_scope_rejection(gate.required);
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_scope_distinguishes_missing_and_insufficient() {
        assert!(matches!(
            check_scope(None, READ_POLICIES),
            Err(GatewayError::MissingScopes)
        ));
        assert!(matches!(
            check_scope(Some(&ScopeSet::default()), READ_POLICIES),
            Err(GatewayError::MissingScopes)
        ));
        let controls = ScopeSet::new([READ_CONTROLS]);
        assert!(matches!(
            check_scope(Some(&controls), WRITE_POLICIES),
            Err(GatewayError::InsufficientScope { required }) if required == WRITE_POLICIES
        ));
        assert!(check_scope(Some(&controls), READ_CONTROLS).is_ok());
    }

    #[test]
    fn default_scopes_cover_controls_and_policies() {
        let scopes = default_token_scopes();
        for scope in [READ_CONTROLS, WRITE_CONTROLS, READ_POLICIES, WRITE_POLICIES] {
            assert!(scopes.contains(scope));
        }
    }
}
