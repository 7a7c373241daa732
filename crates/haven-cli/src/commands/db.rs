//! Database management commands.

use clap::{Args, Subcommand};
use haven_core::Config;
use haven_db::{MigrationManager, Pool, PoolConfig};

#[derive(Args)]
pub struct DbArgs {
    #[command(subcommand)]
    command: DbCommand,
}

#[derive(Subcommand)]
enum DbCommand {
    /// Apply pending schema migrations
    Migrate,
    /// Print the current schema version
    Version,
    /// Check database connectivity
    Ping,
}

pub async fn execute(args: DbArgs) -> anyhow::Result<()> {
    let config = Config::load()?;
    let pool = Pool::new(PoolConfig::for_url(&config.db_dsn)).await?;
    let migrations = MigrationManager::new(&pool);

    match args.command {
        DbCommand::Migrate => {
            let version = migrations.run().await?;
            println!("schema at version {}", version);
        }
        DbCommand::Version => {
            migrations.init().await?;
            println!("schema version {}", migrations.current_version().await?);
        }
        DbCommand::Ping => {
            let health = pool.health_check().await?;
            println!(
                "database reachable, latency {}ms, {} connections ({} idle)",
                health.latency_ms, health.connections, health.idle_connections
            );
        }
    }

    Ok(())
}
