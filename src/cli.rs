use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "ordersettle")]
#[command(about = "Order placement and merchant settlement aggregation service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Bulk-seed the transactions table
    Seed {
        /// Number of transactions to insert
        #[arg(long, default_value_t = 100_000)]
        rows: usize,

        /// Number of distinct merchant ids
        #[arg(long, default_value_t = 50)]
        merchants: usize,

        /// Spread transactions over this many past days
        #[arg(long, default_value_t = 30)]
        days: i64,

        /// Insert chunk size
        #[arg(long, default_value_t = 5_000)]
        chunk: usize,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    use sqlx::migrate::Migrator;
    use std::path::Path;

    let pool = crate::db::create_pool(config).await?;
    let migrator = Migrator::new(Path::new("./migrations")).await?;

    tracing::info!("Running database migrations...");
    migrator.run(&pool).await?;

    tracing::info!("Database migrations completed");
    println!("✓ Database migrations completed");

    Ok(())
}

pub async fn handle_seed(
    config: &Config,
    rows: usize,
    merchants: usize,
    days: i64,
    chunk: usize,
) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let inserted = crate::db::seed::seed_transactions(&pool, rows, merchants, days, chunk).await?;
    println!("✓ Seeded {inserted} transactions");
    Ok(())
}
