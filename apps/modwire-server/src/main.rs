use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modwire::{App, ListenOptions};
use runtime::{AppConfig, CliArgs};
use std::path::{Path, PathBuf};

mod modules;

use modules::AppModule;

/// Modwire demo server - users, auth and health behind guarded routes
#[derive(Parser)]
#[command(name = "modwire-server")]
#[command(about = "Modwire demo server - users, auth and health behind guarded routes")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Build the module graph and print the route table without binding
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if args.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    // relative log files live next to the config file
    let base_dir = cli
        .config
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let logging_config = config.logging.clone().unwrap_or_default();
    runtime::init_logging_from_config(&logging_config, &base_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!("Modwire server starting");
    let opts = ListenOptions::new(&config.server.host, config.server.port)
        .with_shutdown_timeout(config.server.shutdown_timeout);

    let app = App::new(AppModule::new(config)).context("failed to build the application")?;
    app.listen_with(opts).await
}

fn check_config(config: AppConfig) -> Result<()> {
    let app = App::new(AppModule::new(config)).context("failed to build the application")?;
    tracing::info!(modules = app.graph().len(), "module graph is valid");

    println!("Configuration check passed");
    println!("Routes:");
    for (pattern, guards) in app.graph().routes() {
        if guards.is_empty() {
            println!("  {pattern}");
        } else {
            println!("  {pattern}  [{}]", guards.join(", "));
        }
    }
    Ok(())
}
