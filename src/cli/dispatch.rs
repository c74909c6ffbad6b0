use super::config::cmd_config;
use super::env::CliArgs;
use super::eval::cmd_eval;
use super::serve::cmd_serve;
use super::validate::cmd_validate;
use crate::cli::commands::Commands;
use crate::cli::context::CliContext;
use anyhow::Result;

pub async fn dispatch(cli: &CliArgs, ctx: &CliContext) -> Result<()> {
    match cli.command.clone() {
        Commands::Serve(args) => cmd_serve(args, ctx).await,
        Commands::Validate(args) => cmd_validate(args).await,
        Commands::Eval(args) => cmd_eval(args, ctx).await,
        Commands::Config(args) => cmd_config(args, ctx),
    }
}
