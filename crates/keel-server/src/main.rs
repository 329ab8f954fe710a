//! keel binary: the demo server and the migration commands.
//!
//! Loads configuration, initializes structured logging, installs the
//! database plugin, and dispatches the chosen subcommand.

use clap::Parser;
use keel_server::cli::{self, Cli};
use keel_server::{config, Plugin};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (config_path, config_source) = cli::resolve_config_path(cli.config.as_deref());

    // Load configuration
    let config = config::load_config(Some(&config_path))
        .expect("failed to load configuration; keel cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved startup configuration path"
    );

    let plugin = Plugin::with_config(config.database.clone())
        .expect("failed to install database plugin; check database.connection in config");

    if let Err(e) = cli::run(&plugin, &config, cli.command).await {
        tracing::error!(error = %e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
