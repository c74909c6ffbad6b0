pub mod auth;
pub mod errors;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod rate_limit;
pub mod readiness;
pub mod scope;

pub use auth::{BearerAuth, VerifiedCredential};
pub use errors::{GatewayError, HttpError};
pub use http::{router, GatewayOptions, GatewayState};
pub use identity::IdentityKey;
pub use rate_limit::{SlidingWindowLimiter, SweepHandle};
pub use readiness::{DependencyProbe, DependencyStatus, ReadinessReport};
pub use scope::{ScopeResolver, ScopeSet, StaticScopeResolver};
