//! Ingestion pipeline
//!
//! One run drives every requested source concurrently. Per source:
//!
//! 1. `begin_run` resumes an interrupted cursor or starts a fresh one
//! 2. download batch files from the cursor (sequential per source)
//! 3. verify pending batch files against their checksums
//! 4. parse them on the blocking pool, at most `parse_workers` at a time
//! 5. consolidate each file's drafts by identity and upsert them
//! 6. mark a batch file processed as soon as every chunk built from it
//!    has committed, so a crash or a failed chunk leaves only that file
//!    pending
//!
//! After all sources finish, the search index is rebuilt once. Each source
//! writes its own `update_log` row.

use crate::config::IngestConfig;
use crate::db;
use crate::download::{verify_batch, BatchSource, BulkSource, Downloader, RateLimitedClient, TrialsSource};
use crate::error::{IngestError, Result};
use crate::merge::consolidate;
use crate::models::{RunStatus, RunType, Source};
use crate::parse::{parse_file, ParseReport};
use crate::state::{ManifestEntry, StateTracker};
use crate::storage::update_log::{self, overall_status, RunCounts};
use crate::storage::{rebuild_search_index, IndexReport, MirrorStore};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What a run covers
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_type: RunType,
    /// Cap on records downloaded per source
    pub limit: Option<usize>,
    pub sources: Vec<Source>,
}

impl RunOptions {
    pub fn full() -> Self {
        Self {
            run_type: RunType::Full,
            limit: None,
            sources: Source::ALL.to_vec(),
        }
    }

    pub fn incremental() -> Self {
        Self {
            run_type: RunType::Incremental,
            ..Self::full()
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Restrict the run to `sources`; an empty list keeps all of them
    pub fn with_sources(mut self, mut sources: Vec<Source>) -> Self {
        sources.sort();
        sources.dedup();
        if !sources.is_empty() {
            self.sources = sources;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: Source,
    pub run_type: RunType,
    pub status: RunStatus,
    pub counts: RunCounts,
    /// Storage chunks that failed terminally
    pub chunks_failed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub sources: Vec<SourceReport>,
    pub index: Option<IndexReport>,
}

impl PipelineReport {
    pub fn status(&self) -> RunStatus {
        overall_status(self.sources.iter().map(|s| s.status)).unwrap_or(RunStatus::Success)
    }

    pub fn totals(&self) -> RunCounts {
        let mut totals = RunCounts::default();
        for source in &self.sources {
            totals.add(&source.counts);
        }
        totals
    }
}

#[derive(Default)]
struct SourceProgress {
    counts: RunCounts,
    chunks_failed: usize,
}

pub struct Pipeline {
    config: Arc<IngestConfig>,
    tracker: Arc<StateTracker>,
    store: MirrorStore,
}

impl Pipeline {
    pub fn new(config: Arc<IngestConfig>, tracker: Arc<StateTracker>, pool: PgPool) -> Self {
        let store = MirrorStore::new(pool, &config.workers);
        Self {
            config,
            tracker,
            store,
        }
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Upstream adapter for `source`, sharing this pipeline's state tracker
    pub fn batch_source(&self, source: Source) -> Result<Arc<dyn BatchSource>> {
        let config = &self.config;
        match source {
            Source::ClinicalTrials => {
                let client = RateLimitedClient::new(
                    source,
                    Arc::clone(&self.tracker),
                    config.retry.clone(),
                    config.trials.min_interval(),
                    Duration::from_secs(config.trials.request_timeout_secs),
                )?;
                Ok(Arc::new(TrialsSource::new(client, config.trials.base_url.clone())))
            }
            Source::DrugLabels | Source::NdcDirectory | Source::OrangeBook => {
                let client = RateLimitedClient::new(
                    source,
                    Arc::clone(&self.tracker),
                    config.retry.clone(),
                    config.drugs.min_interval(),
                    Duration::from_secs(config.drugs.request_timeout_secs),
                )?;
                Ok(Arc::new(BulkSource::new(client, config.bulk_files(source))?))
            }
        }
    }

    fn downloader(&self, source: Source) -> Result<Downloader> {
        let (records_per_batch, page_size) = match source {
            Source::ClinicalTrials => (self.config.trials.records_per_batch, self.config.trials.page_size),
            _ => (self.config.drugs.records_per_batch, self.config.drugs.records_per_batch),
        };
        Ok(Downloader::new(
            self.batch_source(source)?,
            Arc::clone(&self.tracker),
            &self.config.paths.batch_dir,
            records_per_batch,
            page_size,
        ))
    }

    /// Run every requested source, then rebuild the search index
    ///
    /// Returns `Err` only for fatal conditions (store unreachable, state
    /// not durable). Skipped and failed sources are reported in the result.
    pub async fn run(&self, options: &RunOptions) -> Result<PipelineReport> {
        db::health_check(self.pool())
            .await
            .map_err(|e| IngestError::config(format!("Data store unreachable: {}", e)))?;

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            run_type = options.run_type.as_str(),
            sources = ?options.sources,
            limit = ?options.limit,
            "Ingestion run started"
        );

        let results = join_all(options.sources.iter().map(|source| {
            self.run_source(run_id, *source, options)
                .instrument(info_span!("source_run", %run_id, source = %source))
        }))
        .await;

        let mut sources = Vec::with_capacity(results.len());
        let mut fatal = None;
        for result in results {
            match result {
                Ok(report) => sources.push(report),
                Err(e) => {
                    error!(%run_id, error = %e, "Source aborted the run");
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            // Rows committed by the other sources are still made searchable
            self.rebuild_index(run_id).await;
            return Err(e);
        }

        let index = if sources.iter().any(|s| s.counts.records_processed > 0) {
            self.rebuild_index(run_id).await
        } else {
            None
        };

        let report = PipelineReport { run_id, sources, index };
        let totals = report.totals();
        info!(
            %run_id,
            status = %report.status(),
            records = totals.records_processed,
            skipped = totals.records_skipped,
            failed = totals.records_failed,
            files = totals.files_processed,
            "Ingestion run finished"
        );

        Ok(report)
    }

    async fn rebuild_index(&self, run_id: Uuid) -> Option<IndexReport> {
        match rebuild_search_index(self.pool()).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(%run_id, error = %e, "Search index rebuild failed");
                None
            }
        }
    }

    async fn run_source(&self, run_id: Uuid, source: Source, options: &RunOptions) -> Result<SourceReport> {
        let window_start = match options.run_type {
            RunType::Incremental => {
                Some(Utc::now().date_naive() - chrono::Duration::days(self.config.trials.incremental_window_days))
            }
            RunType::Full => None,
        };

        let cursor = match self.tracker.begin_run(source, options.run_type, window_start).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let log_id = update_log::start_run(self.pool(), run_id, source, options.run_type).await?;
                let message = e.to_string();
                update_log::finish_run(self.pool(), log_id, RunStatus::Failed, &RunCounts::default(), Some(&message))
                    .await?;
                return Err(e);
            }
        };

        let run_type = cursor.run_type;
        let log_id = update_log::start_run(self.pool(), run_id, source, run_type).await?;

        let mut progress = SourceProgress::default();
        let result = self.ingest_source(source, run_type, options.limit, &mut progress).await;

        let (status, error_message) = match &result {
            Ok(()) if progress.chunks_failed == 0 => (RunStatus::Success, None),
            Ok(()) => (
                RunStatus::Failed,
                Some(format!("{} storage chunk(s) failed", progress.chunks_failed)),
            ),
            Err(e) if e.is_source_skip() => (RunStatus::Skipped, Some(e.to_string())),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };

        update_log::finish_run(self.pool(), log_id, status, &progress.counts, error_message.as_deref()).await?;

        match status {
            RunStatus::Success => info!(
                source = %source,
                records = progress.counts.records_processed,
                skipped = progress.counts.records_skipped,
                files = progress.counts.files_processed,
                "Source ingested"
            ),
            RunStatus::Skipped => warn!(
                source = %source,
                reason = error_message.as_deref().unwrap_or_default(),
                "Source skipped"
            ),
            _ => error!(
                source = %source,
                error = error_message.as_deref().unwrap_or_default(),
                "Source failed"
            ),
        }

        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e);
            }
        }

        Ok(SourceReport {
            source,
            run_type,
            status,
            counts: progress.counts,
            chunks_failed: progress.chunks_failed,
            error: error_message,
        })
    }

    async fn ingest_source(
        &self,
        source: Source,
        run_type: RunType,
        limit: Option<usize>,
        progress: &mut SourceProgress,
    ) -> Result<()> {
        let downloader = self.downloader(source)?;

        let download = match run_type {
            RunType::Full => downloader.download_all(limit).await,
            RunType::Incremental => {
                downloader
                    .download_recent(self.config.trials.incremental_window_days, limit)
                    .await
            }
        };

        // Batches already on disk are still processed when the download
        // stops early; the error is reported afterwards.
        let deferred = match download {
            Ok(outcome) => {
                info!(
                    source = %source,
                    batches = outcome.batches.len(),
                    records = outcome.records,
                    hit_limit = outcome.hit_limit,
                    "Download finished"
                );
                None
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(source = %source, error = %e, "Download stopped early");
                Some(e)
            }
        };

        self.process_pending(source, progress).await?;

        if let Some(e) = deferred {
            return Err(e);
        }

        let download_complete = self
            .tracker
            .cursor(source)
            .await
            .is_some_and(|c| c.download_complete);
        if download_complete && progress.chunks_failed == 0 && self.tracker.pending_batches(source).await.is_empty() {
            self.remove_processed(source).await?;
        }

        Ok(())
    }

    /// Verify, parse and store every unprocessed batch file of `source`
    async fn process_pending(&self, source: Source, progress: &mut SourceProgress) -> Result<()> {
        let pending = self.tracker.pending_batches(source).await;
        if pending.is_empty() {
            return Ok(());
        }

        let mut verified = Vec::with_capacity(pending.len());
        for entry in pending {
            if verify_batch(&self.tracker, &entry).await? {
                verified.push(entry);
            } else {
                // Later batches were dropped with it and are downloaded again
                break;
            }
        }

        let group_size = (self.config.workers.parse_workers * 2).max(1);
        for group in verified.chunks(group_size) {
            let reports = self.parse_group(group).await?;

            for (entry, report) in group.iter().zip(reports) {
                progress.counts.records_skipped += report.skipped as u64;

                let upsert = self.store.batch_upsert(consolidate(report.drafts)).await;
                progress.counts.records_processed += upsert.rows_written as u64;
                progress.counts.records_skipped += upsert.rows_rejected as u64;
                progress.counts.records_failed += upsert.rows_failed as u64;

                if upsert.all_committed() {
                    self.tracker.mark_processed(source, entry.batch_number).await?;
                    progress.counts.files_processed += 1;
                } else {
                    progress.chunks_failed += upsert.failures.len();
                    warn!(
                        source = %source,
                        batch_number = entry.batch_number,
                        chunks_failed = upsert.failures.len(),
                        "Batch file not fully stored, left pending"
                    );
                }
            }
        }

        Ok(())
    }

    /// Parse a group of batch files on the blocking pool
    ///
    /// Reports come back in batch order, one per file.
    async fn parse_group(&self, group: &[ManifestEntry]) -> Result<Vec<ParseReport>> {
        let permits = Arc::new(Semaphore::new(self.config.workers.parse_workers.max(1)));
        let mut handles = Vec::with_capacity(group.len());

        for entry in group {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| IngestError::state(e.to_string()))?;
            let path = entry.path.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                parse_file(&path)
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut skip_reasons = BTreeMap::new();
        for handle in handles {
            let report = handle.await??;
            for (reason, count) in &report.skip_reasons {
                *skip_reasons.entry(*reason).or_insert(0usize) += count;
            }
            reports.push(report);
        }

        if !skip_reasons.is_empty() {
            info!(
                files = reports.len(),
                parsed = reports.iter().map(|r| r.parsed).sum::<usize>(),
                reasons = ?skip_reasons,
                "Records skipped while parsing"
            );
        }

        Ok(reports)
    }

    async fn remove_processed(&self, source: Source) -> Result<()> {
        let removed = self.tracker.prune_processed(source).await?;
        for entry in &removed {
            if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %entry.path.display(), error = %e, "Could not remove batch file");
                }
            }
        }
        if !removed.is_empty() {
            info!(source = %source, files = removed.len(), "Processed batch files removed");
        }
        Ok(())
    }
}
