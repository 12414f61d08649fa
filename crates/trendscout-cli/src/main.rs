use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trendscout_sync::{run_scout_once_from_env, ScoutConfig, ScoutPipeline};

#[derive(Debug, Parser)]
#[command(name = "trendscout")]
#[command(about = "Fetch top Hacker News stories into the trends table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the top stories and insert the ones not stored yet (default).
    Scout(ScoutArgs),
    /// Create the trends table and its indexes.
    Migrate,
    /// Print the trends table columns and indexes.
    VerifySchema,
}

#[derive(Debug, Default, Args)]
struct ScoutArgs {
    /// Number of top stories to fetch (overrides TRENDSCOUT_COUNT).
    #[arg(short = 'n', long)]
    count: Option<usize>,
    /// Fetch and print without touching the database.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info")?;

    match cli.command.unwrap_or(Commands::Scout(ScoutArgs::default())) {
        Commands::Scout(args) => {
            let summary = run_scout_once_from_env(args.count, args.dry_run).await?;
            if summary.dry_run {
                println!("{}", serde_json::to_string_pretty(&summary.trends)?);
                println!("trends fetched: {}", summary.fetched);
            } else {
                println!(
                    "successfully processed {} trends: run_id={} inserted={} skipped={}",
                    summary.fetched, summary.run_id, summary.inserted, summary.skipped
                );
            }
        }
        Commands::Migrate => {
            ScoutPipeline::new(ScoutConfig::from_env())?.migrate().await?;
            println!("trends schema is up to date");
        }
        Commands::VerifySchema => {
            let report = ScoutPipeline::new(ScoutConfig::from_env())?
                .verify_schema()
                .await?;
            println!("trends columns:");
            for column in &report.columns {
                let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
                println!("  {}: {} {}", column.name, column.data_type, nullable);
            }
            println!("indexes ({}):", report.indexes.len());
            for index in &report.indexes {
                println!("  {index}");
            }
        }
    }

    Ok(())
}
