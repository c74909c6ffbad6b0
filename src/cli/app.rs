use std::time::Duration;

use agentguard::Config;
use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};

use super::context::CliContext;
use super::dispatch::dispatch;
use super::env::CliArgs;
use super::runtime::{init_logging, load_config};

/// Runs the selected command. Also returns how long the runtime may wait
/// for leftover blocking work before the process exits.
pub async fn run() -> (Result<()>, Duration) {
    let cli = CliArgs::parse();
    let mut drain = Config::default().shutdown_timeout();
    let result = execute(&cli, &mut drain).await;
    (result, drain)
}

async fn execute(cli: &CliArgs, drain: &mut Duration) -> Result<()> {
    init_logging(&cli.log_level, cli.debug, cli.log_format)?;
    debug!("Starting AgentGuard v{}", env!("CARGO_PKG_VERSION"));

    let loaded = load_config(cli.config.as_deref())?;
    *drain = loaded.config.shutdown_timeout();
    let ctx = CliContext::new(loaded.config, loaded.path);

    match dispatch(cli, &ctx).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("Command failed: {:#}", err);
            Err(err)
        }
    }
}
