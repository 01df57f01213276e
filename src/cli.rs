use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "capstan")]
#[command(version)]
#[command(about = "Run cloud provisioning operations in dependency order, with durable state, rollback and resume", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/capstan/capstan.toml)
    #[arg(long, global = true, env = "CAPSTAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Operation catalog root
    #[arg(long, global = true, env = "CAPSTAN_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// State database
    #[arg(long, global = true, env = "CAPSTAN_STATE")]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every operation in dependency order, or a single operation
    Run(RunArgs),

    /// Continue from the first operation that has not succeeded
    Resume,

    /// Show the recorded state of every operation
    Status(StatusArgs),

    /// Run the rollback steps of an operation
    Rollback(RollbackArgs),

    /// Check catalog files against the schema and their dependencies
    Validate(ValidateArgs),

    /// Show the execution order and dependency edges
    Graph(GraphArgs),

    /// List recorded attempts and sessions
    History(HistoryArgs),

    /// Break a state lease left behind by a crashed process
    Unlock(UnlockArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Run only this operation, outside the normal order
    pub operation: Option<String>,

    /// Probe idempotency and show what would execute, without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Only operations of this capability
    #[arg(long, conflicts_with = "operation")]
    pub capability: Option<String>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Show every attempt and rollback of one operation
    #[arg(long)]
    pub operation: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Operation to roll back
    pub operation: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Catalog root or a single operation file (default: the configured catalog)
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct HistoryArgs {
    /// Only attempts of this operation
    #[arg(long)]
    pub operation: Option<String>,

    /// Show at most this many attempts, newest last
    #[arg(short = 'n', long, default_value = "50")]
    pub limit: usize,
}

#[derive(Args)]
pub struct UnlockArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}
