//! Shared helpers for the integration tests
//!
//! `TestPostgres` starts a disposable PostgreSQL container with the
//! migrations applied. Tests that use it need Docker and are `#[ignore]`d;
//! run them with `cargo test -- --ignored`.

#![allow(dead_code)]

use anyhow::{Context, Result};
use medmirror_ingest::config::{IngestConfig, RetryConfig, WorkerConfig};
use medmirror_ingest::download::RateLimitedClient;
use medmirror_ingest::models::Source;
use medmirror_ingest::state::{FileStateRepository, StateTracker};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    url: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        medmirror_ingest::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
            url,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Retry settings small enough for tests to run in milliseconds
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_request_attempts: 3,
        server_error_delay_ms: 10,
        network_error_delay_ms: 10,
        default_retry_after_secs: 60,
        daily_retry_budget: 50,
        max_inline_wait_secs: 30,
    }
}

/// Configuration pointing every source at `upstream` and every path into `dir`
pub fn test_config(dir: &Path, upstream: &str, database_url: &str) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.database.url = database_url.to_string();
    config.paths.batch_dir = dir.join("batches");
    config.paths.state_file = dir.join("state.json");
    config.trials.base_url = format!("{}/api/v2", upstream);
    config.trials.page_size = 2;
    config.trials.records_per_batch = 2;
    config.trials.min_request_interval_ms = 0;
    config.drugs.files = Vec::new();
    config.drugs.min_request_interval_ms = 0;
    config.retry = fast_retry();
    config.workers = WorkerConfig {
        parse_workers: 2,
        storage_workers: 4,
        upsert_batch_size: 3,
        deadlock_max_attempts: 3,
        deadlock_base_delay_ms: 10,
    };
    config
}

pub async fn open_tracker(dir: &Path) -> Arc<StateTracker> {
    let repo = Arc::new(FileStateRepository::new(dir.join("state.json")));
    Arc::new(StateTracker::open(repo).await.unwrap())
}

pub fn client(source: Source, tracker: Arc<StateTracker>, retry: RetryConfig) -> RateLimitedClient {
    RateLimitedClient::new(
        source,
        tracker,
        retry,
        Duration::ZERO,
        Duration::from_secs(5),
    )
    .unwrap()
}

// ============================================================================
// Fixtures
// ============================================================================

/// A v2 API study document
pub fn study(nct_id: &str, title: &str, locations: &[&str]) -> Value {
    let locations: Vec<Value> = locations.iter().map(|city| json!({ "city": city })).collect();
    json!({
        "protocolSection": {
            "identificationModule": { "nctId": nct_id, "briefTitle": title },
            "statusModule": { "overallStatus": "RECRUITING" },
            "conditionsModule": { "conditions": ["Asthma"] },
            "contactsLocationsModule": { "locations": locations }
        },
        "hasResults": false
    })
}

pub fn studies_page(studies: Vec<Value>, next: Option<&str>) -> Value {
    match next {
        Some(token) => json!({ "studies": studies, "nextPageToken": token }),
        None => json!({ "studies": studies }),
    }
}
