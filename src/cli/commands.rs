use clap::Subcommand;

use super::config::ConfigArgs;
use super::eval::EvalArgs;
use super::serve::ServeArgs;
use super::validate::ValidateArgs;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Run the authorization gateway
    Serve(ServeArgs),

    /// Compile policy files, directories or bundles without serving them
    Validate(ValidateArgs),

    /// Evaluate a single input document locally and print the decision
    Eval(EvalArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
