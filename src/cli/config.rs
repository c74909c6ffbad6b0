use anyhow::Result;
use clap::{Args, Subcommand};

use crate::cli::context::CliContext;

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration with secrets redacted
    Show,

    /// Print the configuration file in use
    Path,
}

pub fn cmd_config(args: ConfigArgs, ctx: &CliContext) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let source = ctx
                .config_path()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "defaults".to_string());
            println!("# effective configuration ({source})");
            print!("{}", serde_yaml::to_string(&ctx.config().redacted())?);
        }
        ConfigAction::Path => match ctx.config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("no configuration file; using defaults"),
        },
    }
    Ok(())
}
