use lazy_static::lazy_static;
use prometheus::{core::Collector, opts, IntCounter, IntCounterVec, Registry};
use tracing::error;

lazy_static! {
    static ref GATEWAY_AUTH_FAILURES: IntCounter = IntCounter::new(
        "agentguard_gateway_auth_failures_total",
        "Requests rejected by bearer authentication",
    )
    .unwrap();
    static ref GATEWAY_RATE_LIMITED: IntCounter = IntCounter::new(
        "agentguard_gateway_rate_limited_total",
        "Requests rejected by the rate limiter",
    )
    .unwrap();
    static ref GATEWAY_SCOPE_REJECTIONS: IntCounterVec = IntCounterVec::new(
        opts!(
            "agentguard_gateway_scope_rejections_total",
            "Requests rejected for missing scopes grouped by required scope"
        ),
        &["scope"]
    )
    .unwrap();
    static ref GATEWAY_HOOKS: IntCounterVec = IntCounterVec::new(
        opts!(
            "agentguard_gateway_hooks_total",
            "SDK hook calls grouped by hook"
        ),
        &["hook"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register gateway metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, GATEWAY_AUTH_FAILURES.clone());
    register(registry, GATEWAY_RATE_LIMITED.clone());
    register(registry, GATEWAY_SCOPE_REJECTIONS.clone());
    register(registry, GATEWAY_HOOKS.clone());
}

pub fn record_auth_failure() {
    GATEWAY_AUTH_FAILURES.inc();
}

pub fn record_rate_limited() {
    GATEWAY_RATE_LIMITED.inc();
}

pub fn record_scope_rejection(scope: &str) {
    GATEWAY_SCOPE_REJECTIONS.with_label_values(&[scope]).inc();
}

pub fn record_hook(hook: &str) {
    GATEWAY_HOOKS.with_label_values(&[hook]).inc();
}
