//! CLI command definitions for flowforge.
//!
//! The binary carries operational commands only; orchestration runs through
//! the library API of an embedding server.

use clap::Parser;
use tracing::info;

use crate::config::load_graph;
use crate::storage::Database;

/// Process orchestration and dataset persistence engine.
#[derive(Parser)]
#[command(name = "flowforge")]
#[command(about = "Operational commands for the flowforge engine")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply the fixed-schema database migrations.
    Migrate(MigrateArgs),

    /// Parse and validate a configuration graph.
    CheckConfig(CheckConfigArgs),
}

/// Arguments for `flowforge migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
}

/// Arguments for `flowforge check-config`.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Path to the YAML configuration graph.
    pub path: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Migrate(args) => migrate(args).await,
        Commands::CheckConfig(args) => check_config(args),
    }
}

async fn migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let database = Database::connect(&args.database_url).await?;
    database.run_migrations().await?;
    info!("migrations applied");
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> anyhow::Result<()> {
    let graph = load_graph(&args.path)?;
    let stages = graph.pipeline.stages.len();
    let jobs: usize = graph.pipeline.stages.iter().map(|s| s.jobs.len()).sum();
    let instances: usize = graph.servers.values().map(|s| s.instances.len()).sum();
    info!(
        path = %args.path,
        servers = graph.servers.len(),
        instances,
        stages,
        jobs,
        "configuration is valid"
    );
    Ok(())
}
