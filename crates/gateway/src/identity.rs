use std::fmt;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

pub const TOKEN_SUFFIX_LEN: usize = 8;
const UNKNOWN_REMOTE: &str = "unknown";

/// Key used to bucket requests for rate limiting.
///
/// Authenticated callers are keyed by the tail of their bearer token so the
/// full secret never lands in limiter state; everyone else by remote address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn from_token(token: &str) -> Option<Self> {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() < TOKEN_SUFFIX_LEN {
            return None;
        }
        let suffix: String = chars[chars.len() - TOKEN_SUFFIX_LEN..].iter().collect();
        Some(Self(format!("bearer:{suffix}")))
    }

    pub fn from_remote(remote: Option<SocketAddr>) -> Self {
        match remote {
            Some(addr) => Self(addr.ip().to_string()),
            None => Self(UNKNOWN_REMOTE.to_string()),
        }
    }

    pub fn resolve(token: Option<&str>, remote: Option<SocketAddr>) -> Self {
        token
            .and_then(Self::from_token)
            .unwrap_or_else(|| Self::from_remote(remote))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn remote_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}
