//! Gateway bootstrap: builds the pipeline from configuration and runs it
//! until shutdown.

pub mod probes;

use std::net::SocketAddr;
use std::sync::Arc;

use agentguard_gateway::{
    router, BearerAuth, GatewayState, SlidingWindowLimiter, StaticScopeResolver, SweepHandle,
};
use agentguard_policy::PolicyEngine;
use anyhow::{anyhow, Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::metrics_router;

pub use probes::{database_probe, TcpDatabaseProbe};

/// Everything a running gateway owns besides its listener.
pub struct Gateway {
    pub router: Router,
    pub engine: Arc<PolicyEngine>,
    pub sweeper: SweepHandle,
}

/// Builds the policy engine and the HTTP pipeline. Must run inside a tokio
/// runtime because it starts the rate limiter sweeper.
pub fn build(config: &Config) -> Gateway {
    let engine = Arc::new(PolicyEngine::new(config.policy.engine_options()));
    let policy_set = config.policy.policy_set();
    if policy_set.is_empty() {
        warn!("no policy sources configured; every pre-invoke request will be denied");
    } else if let Err(err) = engine.load_set(&policy_set) {
        warn!(%err, "initial policy load failed; denying until a reload succeeds");
    }

    let limiter = Arc::new(SlidingWindowLimiter::new(
        config.rate_limit.requests,
        config.rate_limit_window(),
    ));
    let sweeper = limiter.spawn_sweeper();

    let auth = Arc::new(BearerAuth::new(
        config.auth.bearer_token.clone(),
        Arc::new(StaticScopeResolver::default()),
    ));

    let state = GatewayState::new(
        Some(Arc::clone(&engine)),
        auth,
        limiter,
        config.gateway_options(),
    )
    .with_probe(database_probe(&config.database));

    Gateway {
        router: router(state).merge(metrics_router()),
        engine,
        sweeper,
    }
}

/// Serves on `listener` until `shutdown` fires, then drains connections for at
/// most `server.shutdown_timeout_secs` and stops the limiter sweeper.
pub async fn serve(config: &Config, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let Gateway {
        router, sweeper, ..
    } = build(config);
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "agentguard gateway listening");

    let signal = shutdown.clone();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { signal.cancelled().await });
    let mut server_task = tokio::spawn(async move { server.await });

    let grace = config.shutdown_timeout();
    let result = tokio::select! {
        joined = &mut server_task => flatten(joined),
        _ = shutdown.cancelled() => {
            info!(grace_secs = grace.as_secs(), "shutdown requested; draining connections");
            match timeout(grace, &mut server_task).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    warn!("graceful shutdown timed out; dropping open connections");
                    server_task.abort();
                    Ok(())
                }
            }
        }
    };

    sweeper.shutdown().await;
    info!("agentguard gateway stopped");
    result
}

fn flatten(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined
        .map_err(|err| anyhow!("server task failed: {err}"))?
        .context("gateway server failure")
}

/// Cancels `token` on Ctrl+C or SIGTERM.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
