//! AgentGuard service
//!
//! Configuration, metrics registry and server bootstrap shared by the
//! `agentguard` binary and its integration tests.

pub mod config;
pub mod metrics;
pub mod server;

pub use config::{Config, LoadedConfig};
