use std::any::Any;
use std::sync::Arc;

use agentguard_policy::{Decision, EvaluationInput, PolicyEngine, PolicySet, DEFAULT_POLICY_PATH};
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, JsonRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any as CorsAny, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{auth_middleware, BearerAuth};
use crate::errors::{GatewayError, GatewayResult};
use crate::metrics;
use crate::rate_limit::{rate_limit_middleware, SlidingWindowLimiter};
use crate::readiness::{check_readiness, DependencyProbe, PolicyEngineProbe, ReadinessReport};
use crate::scope::{require_scope, ScopeGate, READ_POLICIES, WRITE_POLICIES};

pub const DEFAULT_MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub max_body_bytes: usize,
    pub cors_origins: Vec<String>,
    pub scope_bypass: bool,
    /// Sources recompiled by the reload route.
    pub policy_set: PolicySet,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cors_origins: vec!["*".to_string()],
            scope_bypass: false,
            policy_set: PolicySet::default(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    engine: Option<Arc<PolicyEngine>>,
    auth: Arc<BearerAuth>,
    limiter: Arc<SlidingWindowLimiter>,
    probes: Vec<Arc<dyn DependencyProbe>>,
    options: Arc<GatewayOptions>,
}

impl GatewayState {
    pub fn new(
        engine: Option<Arc<PolicyEngine>>,
        auth: Arc<BearerAuth>,
        limiter: Arc<SlidingWindowLimiter>,
        options: GatewayOptions,
    ) -> Self {
        let engine_probe: Arc<dyn DependencyProbe> =
            Arc::new(PolicyEngineProbe::new(engine.clone()));
        Self {
            engine,
            auth,
            limiter,
            probes: vec![engine_probe],
            options: Arc::new(options),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn engine(&self) -> Option<Arc<PolicyEngine>> {
        self.engine.clone()
    }

    pub fn limiter(&self) -> Arc<SlidingWindowLimiter> {
        Arc::clone(&self.limiter)
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    pub async fn readiness(&self) -> ReadinessReport {
        check_readiness(&self.probes).await
    }

    fn require_engine(&self) -> GatewayResult<Arc<PolicyEngine>> {
        self.engine.clone().ok_or(GatewayError::PolicyUnavailable)
    }
}

/// Builds the full gateway router: anonymous health routes plus the
/// authenticated `/api/v1` group, where authentication runs before rate
/// limiting and scope checks run last.
pub fn router(state: GatewayState) -> Router {
    let bypass = state.options.scope_bypass;
    if bypass {
        warn!("scope checks are bypassed; every authenticated caller reaches every route");
    }

    let read_policies = Router::new()
        .route("/policies/status", get(policy_status_handler))
        .route_layer(middleware::from_fn_with_state(
            ScopeGate {
                required: READ_POLICIES,
                bypass,
            },
            require_scope,
        ));
    let write_policies = Router::new()
        .route("/policies/data/*path", put(update_data_handler))
        .route("/policies/reload", post(reload_policies_handler))
        .route_layer(middleware::from_fn_with_state(
            ScopeGate {
                required: WRITE_POLICIES,
                bypass,
            },
            require_scope,
        ));

    let api = Router::new()
        .route("/sdk/pre-invoke", post(pre_invoke_handler))
        .route("/sdk/post-invoke", post(post_invoke_handler))
        .route("/sdk/error", post(error_hook_handler))
        .route("/policies/evaluate", post(evaluate_handler))
        .merge(read_policies)
        .merge(write_policies)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth_middleware,
        ));

    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .nest("/api/v1", api);
    let options = Arc::clone(&state.options);
    transport_layers(routes, &options).with_state(state)
}

/// Body limit, panic recovery, CORS and security headers. Panics are turned
/// into responses innermost so the 500 still gets the headers.
fn transport_layers(
    routes: Router<GatewayState>,
    options: &GatewayOptions,
) -> Router<GatewayState> {
    routes
        .layer(DefaultBodyLimit::max(options.max_body_bytes))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors_layer(&options.cors_origins))
        .layer(security_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .layer(security_header(header::X_FRAME_OPTIONS, "DENY"))
        .layer(security_header(
            header::STRICT_TRANSPORT_SECURITY,
            "max-age=31536000; includeSubDomains",
        ))
        .layer(security_header(header::X_XSS_PROTECTION, "1; mode=block"))
        .layer(security_header(
            header::CONTENT_SECURITY_POLICY,
            "default-src 'self'",
        ))
}

fn security_header(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(CorsAny);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(CorsAny);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%origin, ?err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(allowed))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(%detail, "request handler panicked");
    GatewayError::Internal.into_response()
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

async fn ready_handler(State(state): State<GatewayState>) -> Json<ReadinessReport> {
    Json(state.readiness().await)
}

#[instrument(skip_all)]
async fn pre_invoke_handler(
    State(state): State<GatewayState>,
    body: Result<Bytes, BytesRejection>,
) -> GatewayResult<Json<Decision>> {
    let engine = state.require_engine()?;
    let input = parse_input(body)?;
    let decision = engine.evaluate(DEFAULT_POLICY_PATH, &input).await?;
    info!(
        agent = %input.agent.id,
        tool = input.tool.as_ref().map(|tool| tool.name.as_str()).unwrap_or_default(),
        allow = decision.allow,
        eval_time_us = decision.eval_time_us,
        "pre-invoke decision"
    );
    Ok(Json(decision.with_metadata("decision_id", Uuid::new_v4().to_string())))
}

#[derive(Debug, Default, Deserialize)]
struct EvaluateParams {
    policy: Option<String>,
}

#[instrument(skip_all, fields(policy))]
async fn evaluate_handler(
    State(state): State<GatewayState>,
    Query(params): Query<EvaluateParams>,
    body: Result<Bytes, BytesRejection>,
) -> GatewayResult<Json<Decision>> {
    let engine = state.require_engine()?;
    let policy = params
        .policy
        .filter(|policy| !policy.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_POLICY_PATH.to_string());
    tracing::Span::current().record("policy", policy.as_str());
    let input = parse_input(body)?;
    let decision = engine.evaluate(&policy, &input).await?;
    Ok(Json(decision))
}

/// SDK clients do not always send a JSON content type, so the body is parsed
/// as JSON regardless of headers.
fn parse_input(body: Result<Bytes, BytesRejection>) -> GatewayResult<EvaluationInput> {
    let body = body.map_err(|rejection| GatewayError::Protocol(rejection.body_text()))?;
    serde_json::from_slice(&body).map_err(|err| GatewayError::Protocol(err.to_string()))
}

async fn post_invoke_handler() -> impl IntoResponse {
    metrics::record_hook("post_invoke");
    acknowledged()
}

async fn error_hook_handler() -> impl IntoResponse {
    metrics::record_hook("error");
    acknowledged()
}

fn acknowledged() -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({"status": "acknowledged"})))
}

async fn policy_status_handler(State(state): State<GatewayState>) -> GatewayResult<Json<Value>> {
    let engine = state.require_engine()?;
    let status = serde_json::to_value(engine.status()).map_err(|err| {
        error!(?err, "failed to encode policy status");
        GatewayError::Internal
    })?;
    Ok(Json(status))
}

#[instrument(skip_all)]
async fn update_data_handler(
    State(state): State<GatewayState>,
    Path(path): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> GatewayResult<Json<Value>> {
    let engine = state.require_engine()?;
    let Json(value) =
        payload.map_err(|rejection| GatewayError::BadRequest(rejection.body_text()))?;
    let revision = engine
        .update_data(&path, value)
        .map_err(|err| GatewayError::BadRequest(err.to_string()))?;
    info!(%path, revision, "policy data updated over http");
    Ok(Json(json!({"path": format!("/{}", path.trim_matches('/')), "revision": revision})))
}

#[instrument(skip_all)]
async fn reload_policies_handler(State(state): State<GatewayState>) -> GatewayResult<Json<Value>> {
    let engine = state.require_engine()?;
    let set = state.options.policy_set.clone();
    if set.is_empty() {
        return Err(GatewayError::BadRequest(
            "no policy sources configured".into(),
        ));
    }
    let reloaded = tokio::task::spawn_blocking(move || {
        engine.load_set(&set)?;
        Ok::<_, agentguard_policy::PolicyError>(engine.status())
    })
    .await
    .map_err(|err| {
        error!(?err, "policy reload task failed");
        GatewayError::Internal
    })?;
    match reloaded {
        Ok(status) => {
            info!(policies = status.policies.len(), "policies reloaded");
            Ok(Json(json!({"status": "reloaded", "ready": status.ready})))
        }
        Err(err) => Err(GatewayError::BadRequest(err.to_string())),
    }
}
