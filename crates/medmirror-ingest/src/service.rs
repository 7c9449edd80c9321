//! Programmatic facade used by other collaborators
//!
//! Reads go straight to the canonical tables. `trigger_update` runs the
//! pipeline in the caller's task and is single-flight per process: a call
//! made while another is running returns [`UpdateStatus::AlreadyRunning`]
//! without touching anything.

use crate::config::{IngestConfig, StateBackend};
use crate::db;
use crate::error::Result;
use crate::models::{CanonicalRecord, Domain, RunStatus};
use crate::pipeline::{Pipeline, RunOptions, SourceReport};
use crate::state::{FileStateRepository, PgStateRepository, StateRepository, StateTracker};
use crate::storage::{queries, update_log, SearchFilter, SearchHit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub total_records: i64,
    pub trials: i64,
    pub drugs: i64,
    pub last_update_timestamp: Option<DateTime<Utc>>,
    pub last_update_status: Option<RunStatus>,
    pub last_run_processed: u64,
    pub last_run_skipped: u64,
    pub last_run_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Success,
    /// Every source was rate-limited or out of retry budget
    Skipped,
    Failed,
    AlreadyRunning,
}

impl From<RunStatus> for UpdateStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => UpdateStatus::Success,
            RunStatus::Skipped => UpdateStatus::Skipped,
            RunStatus::Failed | RunStatus::InProgress => UpdateStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub status: UpdateStatus,
    pub run_id: Option<Uuid>,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub files_processed: u64,
    pub sources: Vec<SourceReport>,
}

impl UpdateSummary {
    fn already_running() -> Self {
        Self {
            status: UpdateStatus::AlreadyRunning,
            run_id: None,
            records_processed: 0,
            records_skipped: 0,
            records_failed: 0,
            files_processed: 0,
            sources: Vec::new(),
        }
    }
}

/// Clears the running flag when the update ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MirrorService {
    config: Arc<IngestConfig>,
    pipeline: Pipeline,
    running: AtomicBool,
}

impl MirrorService {
    pub fn new(config: Arc<IngestConfig>, tracker: Arc<StateTracker>, pool: PgPool) -> Self {
        let pipeline = Pipeline::new(Arc::clone(&config), tracker, pool);
        Self {
            config,
            pipeline,
            running: AtomicBool::new(false),
        }
    }

    /// Connect to the store and open the configured state backend
    pub async fn from_config(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let pool = db::create_pool(&config.database).await?;
        Self::with_pool(config, pool).await
    }

    /// Open the configured state backend on an existing pool
    ///
    /// The postgres backend needs the migrations applied first.
    pub async fn with_pool(config: IngestConfig, pool: PgPool) -> Result<Self> {
        let repo: Arc<dyn StateRepository> = match config.state_backend {
            StateBackend::File => Arc::new(FileStateRepository::new(&config.paths.state_file)),
            StateBackend::Postgres => Arc::new(PgStateRepository::new(pool.clone())),
        };
        let tracker = Arc::new(StateTracker::open(repo).await?);

        Ok(Self::new(Arc::new(config), tracker, pool))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        self.pipeline.store().pool()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_updating(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ranked full-text search
    pub async fn search(&self, filter: &SearchFilter, max_results: usize) -> Result<Vec<SearchHit>> {
        queries::search(self.pool(), filter, max_results).await
    }

    /// Canonical record for an identity key, `None` when not mirrored
    pub async fn get_record(&self, domain: Domain, key: &str) -> Result<Option<CanonicalRecord>> {
        queries::get_record(self.pool(), domain, key).await
    }

    pub async fn get_status(&self) -> Result<MirrorStatus> {
        let counts = queries::count_records(self.pool()).await?;
        let latest = update_log::latest_run(self.pool()).await?;

        let (timestamp, status, run_counts) = match latest {
            Some(run) => (
                Some(run.completed_at.unwrap_or(run.started_at)),
                Some(run.status),
                run.counts,
            ),
            None => (None, None, Default::default()),
        };

        Ok(MirrorStatus {
            total_records: counts.total(),
            trials: counts.trials,
            drugs: counts.drugs,
            last_update_timestamp: timestamp,
            last_update_status: status,
            last_run_processed: run_counts.records_processed,
            last_run_skipped: run_counts.records_skipped,
            last_run_failed: run_counts.records_failed,
        })
    }

    /// Run an update over every source
    ///
    /// `bounded` selects an incremental run over the configured window
    /// instead of a full mirror; `limit` caps records downloaded per source.
    pub async fn trigger_update(&self, bounded: bool, limit: Option<usize>) -> Result<UpdateSummary> {
        let options = if bounded {
            RunOptions::incremental()
        } else {
            RunOptions::full()
        };
        self.trigger_update_with(options.with_limit(limit)).await
    }

    pub async fn trigger_update_with(&self, options: RunOptions) -> Result<UpdateSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Update requested while another is running");
            return Ok(UpdateSummary::already_running());
        }
        let _guard = RunningGuard(&self.running);

        let report = self.pipeline.run(&options).await?;
        let totals = report.totals();

        Ok(UpdateSummary {
            status: report.status().into(),
            run_id: Some(report.run_id),
            records_processed: totals.records_processed,
            records_skipped: totals.records_skipped,
            records_failed: totals.records_failed,
            files_processed: totals.files_processed,
            sources: report.sources,
        })
    }
}
