mod catalog;
mod classifier;
mod cli;
mod commands;
mod config;
mod discovery;
mod paths;
mod progress;
mod render;
mod runner;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::CapstanConfig;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use workflow::ErrorCategory;

/// Exit status for a configuration error (EX_CONFIG)
const EXIT_CONFIG: u8 = 78;

/// Exit status when another writer holds the state store (EX_TEMPFAIL)
const EXIT_CONTENTION: u8 = 75;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: CapstanConfig,
    pub catalog: Option<PathBuf>,
    pub state: Option<PathBuf>,
}

impl Context {
    pub fn catalog_dir(&self) -> PathBuf {
        self.config.catalog_dir(self.catalog.as_deref())
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        self.config.state_path(self.state.as_deref())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            ui::error(&format!("{err:#}"));
            let code = exit_code(&err);
            if let Some(advice) = advice(&err) {
                eprintln!("  {advice}");
            }
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "capstan", &mut io::stdout());
        return Ok(0);
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: CapstanConfig::load(cli.config.as_deref())?,
        catalog: cli.catalog,
        state: cli.state,
    };
    log::debug!("Verbosity {}", ctx.verbose);

    match cli.command {
        Command::Run(args) => commands::run::run(&ctx, args),
        Command::Resume => commands::run::resume(&ctx),
        Command::Status(args) => commands::status::run(&ctx, args),
        Command::Rollback(args) => commands::rollback::run(&ctx, args),
        Command::Validate(args) => commands::validate::run(&ctx, args),
        Command::Graph(args) => commands::graph::run(&ctx, args),
        Command::History(args) => commands::history::run(&ctx, args),
        Command::Unlock(args) => commands::unlock::run(&ctx, args),
        Command::Completions { .. } => Ok(0),
    }
}

/// Category of the first error in the chain that has one.
fn category(err: &anyhow::Error) -> Option<ErrorCategory> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<workflow::Error>() {
            return Some(e.category());
        }
        if cause.downcast_ref::<workflow::ConfigError>().is_some()
            || cause.downcast_ref::<catalog::CatalogError>().is_some()
        {
            return Some(ErrorCategory::Configuration);
        }
        if let Some(e) = cause.downcast_ref::<workflow::StoreError>() {
            return Some(if e.is_busy() {
                ErrorCategory::StoreContention
            } else {
                ErrorCategory::Store
            });
        }
        if let Some(e) = cause.downcast_ref::<ledger::Error>() {
            return Some(if e.is_contention() {
                ErrorCategory::StoreContention
            } else {
                ErrorCategory::Store
            });
        }
        None
    })
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match category(err) {
        Some(ErrorCategory::Configuration) => EXIT_CONFIG,
        Some(ErrorCategory::StoreContention) => EXIT_CONTENTION,
        _ => 1,
    }
}

fn advice(err: &anyhow::Error) -> Option<&'static str> {
    category(err).map(|c| c.advice())
}
