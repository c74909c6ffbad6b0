use anyhow::{Context, Result};
use clap::Args;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use agentguard::server::{self, spawn_signal_listener};

use crate::cli::context::CliContext;

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Listen port, overrides server.port
    #[arg(long)]
    pub port: Option<u16>,

    /// Listen address, overrides server.host
    #[arg(long)]
    pub host: Option<String>,
}

pub async fn cmd_serve(args: ServeArgs, ctx: &CliContext) -> Result<()> {
    let mut config = ctx.config().clone();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    server::serve(&config, listener, shutdown).await
}
