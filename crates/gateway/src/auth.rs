use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::identity::{remote_addr, IdentityKey};
use crate::metrics;
use crate::scope::{ScopeResolver, ScopeSet};

pub const MIN_TOKEN_LEN: usize = 32;
const BEARER_PREFIX: &str = "Bearer ";

/// Attached to the request once the bearer token has been verified.
#[derive(Clone, Debug)]
pub struct VerifiedCredential {
    identity: IdentityKey,
    scopes: ScopeSet,
}

impl VerifiedCredential {
    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }
}

pub struct BearerAuth {
    secret: Option<Vec<u8>>,
    resolver: Arc<dyn ScopeResolver>,
}

impl BearerAuth {
    pub fn new(token: Option<String>, resolver: Arc<dyn ScopeResolver>) -> Self {
        let secret = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        match &secret {
            None => warn!("no bearer token configured; authenticated routes will reject every request"),
            Some(token) if token.len() < MIN_TOKEN_LEN => warn!(
                length = token.len(),
                minimum = MIN_TOKEN_LEN,
                "configured bearer token is shorter than recommended"
            ),
            Some(_) => {}
        }
        Self {
            secret: secret.map(String::into_bytes),
            resolver,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        remote: Option<SocketAddr>,
    ) -> Result<VerifiedCredential, GatewayError> {
        let expected = self.secret.as_deref().ok_or(GatewayError::Unauthenticated)?;
        let provided = bearer_token(headers).ok_or(GatewayError::Unauthenticated)?;
        if !tokens_match(provided.as_bytes(), expected) {
            return Err(GatewayError::Unauthenticated);
        }
        let mut credential = VerifiedCredential {
            identity: IdentityKey::resolve(Some(provided), remote),
            scopes: ScopeSet::default(),
        };
        credential.scopes = self.resolver.resolve(&credential);
        Ok(credential)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .filter(|token| !token.is_empty())
}

/// Comparison time does not depend on where the inputs first differ.
pub fn tokens_match(provided: &[u8], expected: &[u8]) -> bool {
    provided.ct_eq(expected).into()
}

pub async fn auth_middleware(
    State(auth): State<Arc<BearerAuth>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let remote = remote_addr(&req);
    match auth.authenticate(req.headers(), remote) {
        Ok(credential) => {
            req.extensions_mut().insert(credential);
            next.run(req).await
        }
        Err(err) => {
            debug!(path = %req.uri().path(), "bearer authentication failed");
            metrics::record_auth_failure();
            err.into_response()
        }
    }
}
