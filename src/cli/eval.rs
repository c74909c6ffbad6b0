use std::path::{Path, PathBuf};

use agentguard_policy::loader::is_tarball;
use agentguard_policy::{Decision, EvaluationInput, PolicyEngine, PolicySet, DEFAULT_POLICY_PATH};
use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;
use tokio::fs;
use tracing::warn;

use crate::cli::context::CliContext;

#[derive(Args, Clone, Debug)]
pub struct EvalArgs {
    /// Evaluation input document (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Rego file, directory or bundle to load (repeat); defaults to the configured sources
    #[arg(long = "policy", value_name = "PATH")]
    pub policies: Vec<PathBuf>,

    /// Include the built-in tool access and data flow policies
    #[arg(long)]
    pub builtin: bool,

    /// JSON object merged into the policy data document before evaluating
    #[arg(long, value_name = "FILE")]
    pub data: Option<PathBuf>,
}

pub async fn cmd_eval(args: EvalArgs, ctx: &CliContext) -> Result<()> {
    let config = ctx.config();
    let set = policy_set(&args, &config.policy.policy_set())?;
    let engine = PolicyEngine::new(config.policy.engine_options());
    if set.is_empty() {
        warn!("no policy sources given; the decision will fail closed");
    } else {
        engine.load_set(&set).context("failed to load policies")?;
    }

    if let Some(path) = &args.data {
        let Value::Object(document) = read_json::<Value>(path).await? else {
            bail!("{} must contain a JSON object", path.display());
        };
        for (key, value) in document {
            engine
                .update_data(&key, value)
                .with_context(|| format!("failed to write data key {key}"))?;
        }
    }

    let input: EvaluationInput = read_json(&args.input).await?;
    let decision = match engine.evaluate(DEFAULT_POLICY_PATH, &input).await {
        Ok(decision) => decision,
        Err(err) => Decision::fail_closed(&err),
    };
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn policy_set(args: &EvalArgs, configured: &PolicySet) -> Result<PolicySet> {
    if args.policies.is_empty() && !args.builtin {
        return Ok(configured.clone());
    }
    let mut set = PolicySet {
        builtin: args.builtin,
        ..PolicySet::default()
    };
    for path in &args.policies {
        if is_tarball(path) {
            if set.bundle.is_some() {
                bail!("only one bundle can be evaluated at a time");
            }
            set.bundle = Some(path.clone());
        } else {
            set.paths.push(path.clone());
        }
    }
    Ok(set)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
