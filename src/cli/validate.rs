use std::path::PathBuf;

use agentguard_policy::PolicyEngine;
use anyhow::{bail, Context, Result};
use clap::Args;

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
    /// Rego files, directories or bundles (`.tar.gz`) to compile together
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,
}

pub async fn cmd_validate(args: ValidateArgs) -> Result<()> {
    let paths = args.paths;
    let report = tokio::task::spawn_blocking(move || PolicyEngine::validate(&paths))
        .await
        .context("validation task failed")?;

    match report {
        Ok(report) => {
            for policy in &report.policies {
                println!("ok      {policy}");
            }
            println!(
                "{} policies compiled, {} data documents mounted",
                report.policies.len(),
                report.documents
            );
            Ok(())
        }
        Err(err) => bail!("policy validation failed: {err}"),
    }
}
