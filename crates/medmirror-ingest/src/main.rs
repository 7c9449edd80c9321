//! MedMirror ingest - operator binary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medmirror_common::logging::{init_logging, LogConfig, LogLevel};
use medmirror_ingest::models::{Domain, Source};
use medmirror_ingest::storage::update_log;
use medmirror_ingest::{db, IngestConfig, MirrorService, RunOptions, SearchFilter};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "medmirror-ingest")]
#[command(author, version, about = "Mirror clinical-trial and drug datasets into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Run an ingestion
    Run {
        /// Only fetch recently updated records
        #[arg(long)]
        incremental: bool,

        /// Cap on records downloaded per source
        #[arg(long)]
        limit: Option<usize>,

        /// Sources to ingest (default: all)
        #[arg(long = "source", value_parser = parse_source)]
        sources: Vec<Source>,
    },

    /// Show record counts and the last run
    Status {
        /// Also list this many recent update_log rows
        #[arg(long, default_value_t = 0)]
        history: i64,
    },

    /// Full-text search
    Search {
        text: String,

        #[arg(long, value_parser = parse_domain)]
        domain: Option<Domain>,

        #[arg(long, default_value_t = 20)]
        max: usize,
    },

    /// Fetch one record by identity key
    Get {
        #[arg(value_parser = parse_domain)]
        domain: Domain,

        key: String,
    },
}

fn parse_source(raw: &str) -> Result<Source, String> {
    raw.parse()
}

fn parse_domain(raw: &str) -> Result<Domain, String> {
    raw.parse()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("medmirror-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().context("Invalid logging configuration")?;
    let _log_guard = init_logging(&log_config).context("Failed to initialize logging")?;

    let config = IngestConfig::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;

    if matches!(cli.command, Command::Migrate | Command::Run { .. }) {
        db::run_migrations(&pool).await.context("Migration failed")?;
    }
    if matches!(cli.command, Command::Migrate) {
        info!("Database schema is up to date");
        return Ok(());
    }

    let service = MirrorService::with_pool(config, pool)
        .await
        .context("Failed to start ingest service")?;

    match cli.command {
        Command::Migrate => {},
        Command::Run {
            incremental,
            limit,
            sources,
        } => {
            let options = if incremental {
                RunOptions::incremental()
            } else {
                RunOptions::full()
            };
            let summary = service
                .trigger_update_with(options.with_limit(limit).with_sources(sources))
                .await
                .context("Ingestion run failed")?;
            print_json(&summary)?;
        },
        Command::Status { history } => {
            let status = service.get_status().await.context("Failed to read status")?;
            print_json(&status)?;
            if history > 0 {
                let runs = update_log::recent_runs(service.pool(), history).await?;
                print_json(&runs)?;
            }
        },
        Command::Search { text, domain, max } => {
            let filter = SearchFilter {
                domain,
                ..SearchFilter::text(text)
            };
            let hits = service.search(&filter, max).await.context("Search failed")?;
            print_json(&hits)?;
        },
        Command::Get { domain, key } => {
            match service.get_record(domain, &key).await.context("Lookup failed")? {
                Some(record) => print_json(&record)?,
                None => anyhow::bail!("No {} record for {}", domain, key),
            }
        },
    }

    Ok(())
}
