use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use adpulse_client::{ReqwestFetcher, StatusClassifier};
use adpulse_core::monitor::{DEFAULT_RETENTION_DAYS, DEFAULT_WINDOW_HOURS, MAX_WINDOW_HOURS};
use adpulse_core::traits::{EventStore, Fetcher};
use adpulse_core::{BlockingStats, CoordinatorConfig, StatsCoordinator, StatsResult, ThrottleKnobs};
use adpulse_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "adpulse", version, about = "Adaptive ad library stats scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up the active ad count of one page
    Stats {
        /// Advertiser page id
        #[arg(short, long)]
        page_id: String,

        /// Two-letter country code
        #[arg(short, long, default_value = "US")]
        country: String,
    },

    /// Look up many pages from a CSV file with `page_id,country` columns
    Bulk {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Show blocking pressure and the resulting throttle settings
    Blocking {
        #[arg(
            short,
            long,
            default_value_t = DEFAULT_WINDOW_HOURS,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_WINDOW_HOURS))
        )]
        window_hours: u32,
    },

    /// Delete stored blocking events older than N days (requires DATABASE_URL)
    Purge {
        #[arg(
            short,
            long,
            default_value_t = DEFAULT_RETENTION_DAYS,
            value_parser = clap::value_parser!(i64).range(1..=MAX_RETENTION_DAYS)
        )]
        days: i64,
    },
}

/// Longest retention `purge` accepts, about a century.
const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Deserialize, PartialEq)]
struct BulkRow {
    page_id: String,
    country: String,
}

#[derive(Debug, Serialize)]
struct BulkOutput {
    page_id: String,
    country: String,
    success: bool,
    active_count: Option<u64>,
    display_name: Option<String>,
    error: Option<String>,
    execution_time_ms: u64,
}

impl BulkOutput {
    fn new(row: BulkRow, result: StatsResult) -> Self {
        let (active_count, display_name) = match result.stats {
            Some(stats) => (Some(stats.active_count), stats.display_name),
            None => (None, None),
        };
        Self {
            page_id: row.page_id,
            country: row.country,
            success: result.success,
            active_count,
            display_name,
            error: result.error,
            execution_time_ms: result.execution_time_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("adpulse=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = CoordinatorConfig::from_env().context("Invalid coordinator configuration")?;
    let fetcher =
        ReqwestFetcher::with_timeout(config.fetch_timeout).context("Failed to create HTTP client")?;
    let builder = StatsCoordinator::builder(fetcher)
        .with_classifier(StatusClassifier)
        .with_config(config);

    match DatabaseConfig::from_env_if_set().context("Invalid database configuration")? {
        Some(db_config) => {
            let db = connect_db(&db_config).await?;
            run(cli.command, builder.with_store(db.event_repo()).build()).await
        }
        None => {
            tracing::info!("DATABASE_URL not set; blocking events are kept in memory only");
            run(cli.command, builder.build()).await
        }
    }
}

async fn connect_db(config: &DatabaseConfig) -> Result<Database> {
    let db = Database::connect(config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    Ok(db)
}

async fn run<F, S>(command: Commands, coordinator: StatsCoordinator<F, S>) -> Result<()>
where
    F: Fetcher + 'static,
    S: EventStore + 'static,
{
    match command {
        Commands::Stats { page_id, country } => {
            let result = coordinator.get_stats(&page_id, &country).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Bulk { input } => {
            let file = std::fs::File::open(&input)
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let rows = read_rows(file)?;
            tracing::info!(count = rows.len(), "Starting bulk lookup");

            let lookups = rows.iter().map(|row| coordinator.get_stats(&row.page_id, &row.country));
            let results = join_all(lookups).await;

            let outputs: Vec<_> = rows
                .into_iter()
                .zip(results)
                .map(|(row, result)| BulkOutput::new(row, result))
                .collect();
            write_rows(std::io::stdout().lock(), &outputs)?;

            let perf = coordinator.performance_stats();
            tracing::info!(
                total = perf.total_requests,
                cache_hits = perf.cache_hits,
                successful = perf.successful_scrapes,
                errors = perf.errors,
                coalesced = perf.coalesced_requests,
                success_rate = perf.success_rate,
                "Bulk lookup complete"
            );
        }
        Commands::Blocking { window_hours } => {
            let stats = coordinator.monitor().compute_stats(window_hours).await;
            println!("{}", serde_json::to_string_pretty(&blocking_report(stats))?);
        }
        Commands::Purge { days } => {
            if !coordinator.monitor().event_log().has_durable_store() {
                bail!("DATABASE_URL not set. Required for the purge command.");
            }
            let Some(max_age) = TimeDelta::try_days(days) else {
                bail!("--days {days} is out of range");
            };
            let removed = coordinator
                .purge_events_older_than(max_age)
                .await
                .context("Failed to purge blocking events")?;
            println!("Removed {removed} blocking events older than {days} days");
        }
    }

    Ok(())
}

/// Blocking stats for a window together with the knobs its severity implies.
fn blocking_report(stats: BlockingStats) -> serde_json::Value {
    let knobs = ThrottleKnobs::for_severity(stats.current_severity);
    serde_json::json!({
        "blocking": stats,
        "throttle": knobs,
    })
}

fn read_rows(reader: impl Read) -> Result<Vec<BulkRow>> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    csv.deserialize::<BulkRow>()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("Invalid CSV row {}", i + 2)))
        .collect()
}

fn write_rows(writer: impl Write, rows: &[BulkOutput]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row)?;
    }
    csv.flush()?;
    Ok(())
}
