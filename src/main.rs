//! byoe - snapshot build orchestrator
//!
//! CLI entry point that dispatches to subcommands.

use byoe::cli::{Cli, Commands};
use byoe::config::ConfigManager;
use byoe::error::ByoeResult;
use clap::{CommandFactory, Parser};
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
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

async fn run() -> ByoeResult<()> {
    let cli = Cli::parse();

    // These don't need a site config
    match cli.command {
        Commands::InitDir(args) => {
            init_logging(cli.verbose, false);
            return byoe::cli::commands::init_dir(args, cli.config.as_deref()).await;
        }
        Commands::Completions(args) => {
            clap_complete::generate(
                args.shell,
                &mut Cli::command(),
                "byoe",
                &mut std::io::stdout(),
            );
            return Ok(());
        }
        _ => {}
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;
    init_logging(cli.verbose, config.general.log_format == "json");
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::InitDir(_) | Commands::Completions(_) => Ok(()),
        Commands::Update(args) => byoe::cli::commands::update(args, &config).await,
        Commands::Snapshots(args) => byoe::cli::commands::snapshots(args, &config).await,
        Commands::Show(args) => byoe::cli::commands::show(args, &config).await,
        Commands::Cache(args) => byoe::cli::commands::cache(args, &config).await,
    }
}

/// 0 = warn (spinners only), 1 = info, 2+ = debug; RUST_LOG wins when set
fn init_logging(verbose: u8, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("byoe=warn"),
        1 => EnvFilter::new("byoe=info"),
        _ => EnvFilter::new("byoe=debug"),
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
