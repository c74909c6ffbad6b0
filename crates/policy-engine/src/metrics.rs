use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, opts, Histogram, IntCounter, IntCounterVec, Registry,
};
use tracing::error;

lazy_static! {
    static ref POLICY_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "agentguard_policy_decisions_total",
            "Policy decisions grouped by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    static ref POLICY_EVAL_SECONDS: Histogram = Histogram::with_opts(histogram_opts!(
        "agentguard_policy_eval_seconds",
        "Policy evaluation latency",
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]
    ))
    .unwrap();
    static ref POLICY_LOADS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "agentguard_policy_loads_total",
            "Policy load attempts grouped by result"
        ),
        &["result"]
    )
    .unwrap();
    static ref POLICY_DATA_WRITES_TOTAL: IntCounter = IntCounter::new(
        "agentguard_policy_data_writes_total",
        "Committed policy data store writes",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register policy metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, POLICY_DECISIONS_TOTAL.clone());
    register(registry, POLICY_EVAL_SECONDS.clone());
    register(registry, POLICY_LOADS_TOTAL.clone());
    register(registry, POLICY_DATA_WRITES_TOTAL.clone());
}

pub fn record_decision(outcome: &str, seconds: f64) {
    POLICY_DECISIONS_TOTAL.with_label_values(&[outcome]).inc();
    POLICY_EVAL_SECONDS.observe(seconds);
}

pub fn record_load(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    POLICY_LOADS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_data_write() {
    POLICY_DATA_WRITES_TOTAL.inc();
}
