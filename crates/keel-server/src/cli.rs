//! Command-line interface.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use crate::app::{app, DemoState};
use crate::config::Config;
use crate::error::CommandError;
use crate::plugin::Plugin;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "SQLite-backed axum application with migrations")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve the demo application
    Serve,

    /// Apply pending migrations
    DbMigrate {
        /// Stop after this migration
        name: Option<String>,

        /// Record migrations as applied without running them
        #[arg(long)]
        fake: bool,
    },

    /// Create a new migration
    DbCreate {
        /// Migration name
        #[arg(default_value = "auto")]
        name: String,

        /// Generate the migration from the registered models
        #[arg(long)]
        auto: bool,
    },

    /// Roll back the latest applied migration
    DbRollback,

    /// List applied and pending migrations
    DbList,

    /// Clear the migration history
    DbClear,

    /// Merge all migrations into one
    DbMerge {
        /// Name of the merged migration
        #[arg(default_value = "initial")]
        name: String,
    },
}

/// Resolves the config file path: `--config`, then `KEEL_CONFIG_PATH`,
/// then `keel.toml`. Returns the path and where it came from.
pub fn resolve_config_path(cli_path: Option<&str>) -> (String, &'static str) {
    if let Some(path) = cli_path.filter(|value| !value.trim().is_empty()) {
        return (path.to_string(), "cli-arg");
    }

    if let Ok(path) = std::env::var("KEEL_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("keel.toml".to_string(), "default")
}

/// Runs a migration command with the pool open, closing it afterwards.
async fn with_pool<T, F>(plugin: &Plugin, command: F) -> Result<T, CommandError>
where
    F: std::future::Future<Output = Result<T, crate::PluginError>>,
{
    let _guard = plugin.enter().await?;
    Ok(command.await?)
}

/// Runs `command` against an installed `plugin`.
///
/// The demo model is registered before dispatch so `db-create --auto` and
/// `serve` see it.
pub async fn run(plugin: &Plugin, config: &Config, command: Commands) -> Result<(), CommandError> {
    let state = DemoState::new(plugin.clone());

    match command {
        Commands::Serve => {
            let router = app(state)?;
            let addr = SocketAddr::new(config.server.host, config.server.port);
            crate::serve(plugin, router, addr).await?;
        }
        Commands::DbMigrate { name, fake } => {
            let applied = with_pool(plugin, plugin.migrate(name, fake)).await?;
            if applied.is_empty() {
                println!("Nothing to migrate");
            }
            for name in applied {
                println!("Migrated {name}");
            }
        }
        Commands::DbCreate { name, auto } => {
            match with_pool(plugin, plugin.create_migration(&name, auto)).await? {
                Some(created) => println!("Created {created}"),
                None => println!("No changes found"),
            }
        }
        Commands::DbRollback => {
            let name = with_pool(plugin, plugin.rollback_migration()).await?;
            println!("Rolled back {name}");
        }
        Commands::DbList => {
            let status = with_pool(plugin, plugin.list_migrations()).await?;
            println!("{status}");
        }
        Commands::DbClear => {
            let removed = with_pool(plugin, plugin.clear_migrations()).await?;
            println!("Cleared {removed} history rows");
        }
        Commands::DbMerge { name } => {
            let merged = with_pool(plugin, plugin.merge_migrations(&name)).await?;
            println!("Merged into {merged}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn migration_subcommands_are_registered() {
        let cli = Cli::command();
        let names: Vec<&str> = cli.get_subcommands().map(|c| c.get_name()).collect();
        for expected in [
            "serve",
            "db-migrate",
            "db-create",
            "db-rollback",
            "db-list",
            "db-clear",
            "db-merge",
        ] {
            assert!(names.contains(&expected), "missing subcommand {expected}");
        }
    }

    #[test]
    fn arguments_parse() {
        let cli = Cli::try_parse_from(["keel", "db-migrate", "002_users", "--fake"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::DbMigrate {
                name: Some("002_users".to_string()),
                fake: true
            }
        );

        let cli = Cli::try_parse_from(["keel", "--config", "app.toml", "db-create", "--auto"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some("app.toml"));
        assert_eq!(
            cli.command,
            Commands::DbCreate {
                name: "auto".to_string(),
                auto: true
            }
        );

        let cli = Cli::try_parse_from(["keel", "db-merge"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::DbMerge {
                name: "initial".to_string()
            }
        );
    }

    #[test]
    fn cli_argument_wins_for_config_path() {
        let (path, source) = resolve_config_path(Some("custom.toml"));
        assert_eq!(path, "custom.toml");
        assert_eq!(source, "cli-arg");
    }
}
