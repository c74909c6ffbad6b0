use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::error;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();
        agentguard_policy::metrics::register_metrics(registry);
        agentguard_gateway::metrics::register_metrics(registry);
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

/// `GET /metrics`, served next to the gateway routes without authentication.
pub fn metrics_router() -> Router {
    register_metrics();
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = global_registry().gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return encode_failure();
    }

    match HeaderValue::from_str(encoder.format_type()) {
        Ok(value) => ([(header::CONTENT_TYPE, value)], buffer).into_response(),
        Err(err) => {
            error!(?err, "failed to build content-type header");
            encode_failure()
        }
    }
}

fn encode_failure() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
}
