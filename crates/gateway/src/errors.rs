use agentguard_policy::{Decision, PolicyError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthenticated,
    #[error("missing auth scopes")]
    MissingScopes,
    #[error("insufficient scope, {required} required")]
    InsufficientScope { required: String },
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("invalid request body: {0}")]
    Protocol(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("policy engine not configured")]
    PolicyUnavailable,
    #[error(transparent)]
    PolicyEvaluation(#[from] PolicyError),
    #[error("internal error")]
    Internal,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    body: Value,
}

impl HttpError {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn message(status: StatusCode, message: &str) -> Self {
        Self::new(status, json!({ "error": message }))
    }

    fn denial(status: StatusCode, decision: Decision) -> Self {
        let body = serde_json::to_value(decision)
            .unwrap_or_else(|_| json!({"allow": false, "reasons": ["denied"]}));
        Self::new(status, body)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Value {
        &self.body
    }
}

impl From<GatewayError> for HttpError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Unauthenticated => {
                HttpError::message(StatusCode::UNAUTHORIZED, "unauthorized")
            }
            GatewayError::MissingScopes => {
                HttpError::message(StatusCode::FORBIDDEN, "missing auth scopes")
            }
            GatewayError::InsufficientScope { required } => HttpError::new(
                StatusCode::FORBIDDEN,
                json!({"error": "insufficient scope", "required": required}),
            ),
            GatewayError::RateLimited => {
                HttpError::message(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
            }
            GatewayError::Protocol(_) => HttpError::denial(
                StatusCode::BAD_REQUEST,
                Decision::deny("invalid request body").with_metadata("outcome", "invalid_input"),
            ),
            GatewayError::BadRequest(detail) => HttpError::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "bad request", "detail": detail}),
            ),
            GatewayError::PolicyUnavailable => HttpError::denial(
                StatusCode::FORBIDDEN,
                Decision::deny("policy engine not configured, denying by default")
                    .with_metadata("outcome", "unavailable"),
            ),
            GatewayError::PolicyEvaluation(err) => {
                let status = if err.is_protocol() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::FORBIDDEN
                };
                HttpError::denial(status, Decision::fail_closed(&err))
            }
            GatewayError::Internal => {
                HttpError::message(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        HttpError::from(self).into_response()
    }
}
