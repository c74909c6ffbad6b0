use std::collections::BTreeMap;
use std::sync::Arc;

use agentguard_policy::PolicyEngine;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Ok,
    Unavailable,
    NoPoliciesLoaded,
}

impl DependencyStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, DependencyStatus::Ok)
    }
}

/// A dependency whose health feeds the readiness report.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> DependencyStatus;
}

/// Reports the policy engine as `no_policies_loaded` until a load succeeds.
pub struct PolicyEngineProbe {
    engine: Option<Arc<PolicyEngine>>,
}

impl PolicyEngineProbe {
    pub fn new(engine: Option<Arc<PolicyEngine>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl DependencyProbe for PolicyEngineProbe {
    fn name(&self) -> &str {
        "policy_engine"
    }

    async fn check(&self) -> DependencyStatus {
        match &self.engine {
            None => DependencyStatus::Unavailable,
            Some(engine) if engine.ready() => DependencyStatus::Ok,
            Some(_) => DependencyStatus::NoPoliciesLoaded,
        }
    }
}

/// Stands in for a dependency that was never configured.
pub struct MissingDependency {
    name: String,
}

impl MissingDependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DependencyProbe for MissingDependency {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> DependencyStatus {
        DependencyStatus::Unavailable
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ReadinessReport {
    pub status: &'static str,
    pub checks: BTreeMap<String, DependencyStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

pub async fn check_readiness(probes: &[Arc<dyn DependencyProbe>]) -> ReadinessReport {
    let mut checks = BTreeMap::new();
    for probe in probes {
        checks.insert(probe.name().to_string(), probe.check().await);
    }
    let status = if checks.values().all(|status| status.is_ok()) {
        "ready"
    } else {
        "degraded"
    };
    ReadinessReport {
        status,
        checks,
        timestamp: Utc::now(),
    }
}
