//! gfs - Generic filesystem access
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use gfs::cli::{commands, Cli, Commands};
use gfs::config::{Config, ConfigManager};
use gfs::error::GfsResult;
use gfs::Gfs;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> GfsResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load()?;

    init_logging(cli.verbose, &config);
    debug!("Using configuration from {}", config_manager.path().display());

    // Config command doesn't need backends
    if let Commands::Config(args) = cli.command {
        return commands::config(args, &config_manager, &config);
    }

    let gfs = gfs::init(Gfs::new(config))?;

    match cli.command {
        Commands::Config(_) => unreachable!("Config handled above"),
        Commands::Cat(args) => commands::cat(args, gfs),
        Commands::Stat(args) => commands::stat(args, gfs),
        Commands::Ls(args) => commands::ls(args, gfs),
        Commands::Cp(args) => commands::cp(args, gfs),
        Commands::Mv(args) => commands::mv(args, gfs),
        Commands::Rm(args) => commands::rm(args, gfs),
        Commands::Mkdir(args) => commands::mkdir(args, gfs),
        Commands::Fetch(args) => commands::fetch(args, gfs),
        Commands::Cache(args) => commands::cache(args, gfs),
    }
}

/// 0 = warn, 1 = info, 2+ = debug. `RUST_LOG` wins when set.
fn init_logging(verbose: u8, config: &Config) {
    let default = match verbose {
        0 => "gfs=warn",
        1 => "gfs=info",
        _ => "gfs=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
