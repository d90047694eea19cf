use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConfigLoader;
use crate::journaling::SystemClock;
use crate::storage;

pub mod commands;

use self::commands::{EditArgs, HistoryArgs};

#[derive(Parser, Debug)]
#[command(name = "jrnl", version, about = "Daily mood journal that keeps working offline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over JRNL_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over JRNL_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print today's entry (default)
    Today,
    /// Change today's entry and save it
    Edit(EditArgs),
    /// List entries of previous days
    History(HistoryArgs),
    /// Edit today's entry line by line from stdin
    Session,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("JRNL_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("JRNL_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?;

    // Read before any runtime thread exists.
    let clock = SystemClock::local();

    let command = cli.command.unwrap_or(Commands::Today);
    match command {
        Commands::Today => commands::show_today(&storage, &clock),
        Commands::History(args) => commands::show_history(&storage, args, config.history_limit),
        Commands::Edit(args) => {
            runtime()?.block_on(commands::edit_today(config.sync.clone(), storage, clock, args))
        }
        Commands::Session => {
            runtime()?.block_on(commands::run_session(config.sync.clone(), storage, clock))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
