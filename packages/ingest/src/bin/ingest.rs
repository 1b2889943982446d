//! Navusoft ingest CLI
//!
//! Runs an extraction from a YAML config, or inspects the remote catalog.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ingest::pipeline::Extractor;
use ingest::sinks::{PostgresSink, SqliteSink};
use ingest::watermark::postgres::postgres_pool;
use ingest::watermark::sqlite::sqlite_pool;
use ingest::watermark::{PostgresWatermarks, SqliteWatermarks};
use ingest::{IngestConfig, LoadSink, RunSummary, WatermarkStore};
use navu_client::NavuClient;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ingest")]
#[command(about = "Incremental extraction from the Navusoft query API")]
struct Cli {
    /// Path to the YAML run configuration
    #[arg(short, long, default_value = "ingest.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, stage and load every configured entity
    Run {
        /// Ignore watermarks and replace raw rows for each loaded entity
        #[arg(long)]
        full_reload: bool,

        /// Overlap window in hours (0 disables it)
        #[arg(long)]
        overlap_hours: Option<u32>,

        /// Entities extracted at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Directory for staged artifacts
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// List entity ids in the remote catalog
    Entities,

    /// Show the catalog columns for an entity
    Columns { entity: String },

    /// Send a single-row probe query
    Check {
        /// Entity to probe (defaults to the first configured entity)
        #[arg(long)]
        entity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            full_reload,
            overlap_hours,
            concurrency,
            output_dir,
        } => {
            config.run.force_full_reload |= full_reload;
            if let Some(hours) = overlap_hours {
                config.run.overlap_hours = hours;
            }
            if let Some(concurrency) = concurrency {
                config.run.max_concurrency = concurrency;
            }
            if let Some(dir) = output_dir {
                config.run.output_dir = dir;
            }
            config.validate()?;

            let summary = run(&config).await?;
            for outcome in &summary.outcomes {
                println!("{}", outcome);
            }
            println!("{}", summary);

            if !summary.is_success() {
                bail!(
                    "{} entities failed: {}",
                    summary.failed_entities().len(),
                    summary.failed_entities().join(", ")
                );
            }
        }
        Commands::Entities => {
            let client = client(&config)?;
            for id in client.entity_ids().await? {
                println!("{}", id);
            }
        }
        Commands::Columns { entity } => {
            let client = client(&config)?;
            for column in client.resolve_columns(&entity).await? {
                println!("{}", column);
            }
        }
        Commands::Check { entity } => {
            let client = client(&config)?;
            let target = match entity {
                Some(name) => config
                    .entities
                    .iter()
                    .find(|e| e.name == name)
                    .cloned()
                    .unwrap_or_else(|| ingest::EntityConfig::new(name)),
                None => config
                    .entities
                    .first()
                    .cloned()
                    .context("No entities configured")?,
            };

            let columns = target
                .column_source()
                .resolve(&client, &target.name)
                .await?;
            let rows = client.probe(&target.name, &columns).await?;
            println!("OK: {} returned {} row(s)", target.name, rows.len());
        }
    }

    Ok(())
}

fn client(config: &IngestConfig) -> Result<NavuClient> {
    let client_config = config.client_config()?;
    Ok(NavuClient::new(client_config)?)
}

/// Pick store and sink from the warehouse URL scheme.
async fn run(config: &IngestConfig) -> Result<RunSummary> {
    let client = client(config)?;
    let url = config.database_url()?;

    if url.starts_with("sqlite:") {
        let pool = sqlite_pool(url).await.context("Failed to open SQLite warehouse")?;
        let watermarks = SqliteWatermarks::from_pool(pool.clone()).await?;
        let sink = SqliteSink::from_pool(pool).await?;
        extract(config, client, watermarks, sink).await
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        let pool = postgres_pool(url)
            .await
            .context("Failed to connect to warehouse")?;
        let watermarks = PostgresWatermarks::from_pool(pool.clone()).await?;
        let sink = PostgresSink::from_pool(pool).await?;
        extract(config, client, watermarks, sink).await
    } else {
        bail!("Unsupported warehouse URL scheme (expected sqlite: or postgres:)")
    }
}

async fn extract<W, K>(
    config: &IngestConfig,
    client: NavuClient,
    watermarks: W,
    sink: K,
) -> Result<RunSummary>
where
    W: WatermarkStore,
    K: LoadSink,
{
    let extractor = Extractor::new(
        client,
        watermarks,
        sink,
        config.run.output_dir.clone(),
        config.extract_settings(),
        config.run_context(),
    );
    Ok(extractor.run(&config.entities).await?)
}
