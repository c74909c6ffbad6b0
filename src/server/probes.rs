use std::sync::Arc;
use std::time::Duration;

use agentguard_gateway::readiness::MissingDependency;
use agentguard_gateway::{DependencyProbe, DependencyStatus};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::DatabaseConfig;

const DATABASE: &str = "database";

/// Treats the database as ready when a TCP connection can be opened in time.
pub struct TcpDatabaseProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpDatabaseProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl DependencyProbe for TcpDatabaseProbe {
    fn name(&self) -> &str {
        DATABASE
    }

    async fn check(&self) -> DependencyStatus {
        match timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(_)) => DependencyStatus::Ok,
            Ok(Err(err)) => {
                debug!(host = %self.host, port = self.port, ?err, "database probe failed");
                DependencyStatus::Unavailable
            }
            Err(_) => {
                debug!(host = %self.host, port = self.port, "database probe timed out");
                DependencyStatus::Unavailable
            }
        }
    }
}

pub fn database_probe(config: &DatabaseConfig) -> Arc<dyn DependencyProbe> {
    match config.host.as_deref().map(str::trim) {
        Some(host) if !host.is_empty() => Arc::new(TcpDatabaseProbe::new(
            host,
            config.port,
            Duration::from_millis(config.connect_timeout_ms),
        )),
        _ => Arc::new(MissingDependency::new(DATABASE)),
    }
}
