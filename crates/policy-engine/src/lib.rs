pub mod api;
pub mod defaults;
pub mod errors;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod store;

pub use api::{EngineOptions, EngineStatus, PolicyEngine, PolicySet, DEFAULT_POLICY_PATH};
pub use errors::PolicyError;
pub use model::{
    AgentContext, DataContext, Decision, EvaluationInput, RequestContext, ToolContext, Violation,
};
pub use store::{PolicyStore, StorePath, WriteTransaction};

#[cfg(test)]
mod tests;
