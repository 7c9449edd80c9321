//! Downloaders
//!
//! A [`BatchSource`] knows how to fetch the next slice of upstream records
//! from a continuation token. [`Downloader`] drives it: it writes each slice
//! to a self-describing batch file, syncs it to disk, and only then advances
//! the persisted cursor, so an interrupted run resumes from the last batch
//! file that is known to be complete.

pub mod archive;
pub mod bulk;
pub mod client;
pub mod trials;

pub use bulk::BulkSource;
pub use client::RateLimitedClient;
pub use trials::TrialsSource;

use crate::error::{IngestError, Result};
use crate::models::{RunType, Source};
use crate::state::{ManifestEntry, StateTracker};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Records returned by one `fetch_batch` call
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub records: Vec<serde_json::Value>,
    pub upstream_calls: u32,
    /// `None` once upstream is exhausted
    pub next_token: Option<String>,
}

/// One upstream distribution that can be read in token-delimited slices
#[async_trait]
pub trait BatchSource: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch up to `max_records` records starting at `token`
    ///
    /// `page_size` bounds each individual upstream request. `since` restricts
    /// the result to records modified on or after that date, where the
    /// upstream supports it.
    async fn fetch_batch(
        &self,
        token: Option<&str>,
        max_records: usize,
        page_size: usize,
        since: Option<NaiveDate>,
    ) -> Result<FetchedBatch>;
}

/// Self-describing unit of downloaded, not yet parsed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    pub source: Source,
    pub batch_number: u64,
    pub record_count: usize,
    pub upstream_calls: u32,
    /// Token this batch was fetched from
    pub start_token: Option<String>,
    /// Token for the batch after this one
    pub next_token: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    pub records: Vec<serde_json::Value>,
}

impl BatchFile {
    pub fn file_name(source: Source, batch_number: u64) -> String {
        format!("{}_batch_{:06}.json", source.as_str(), batch_number)
    }

    /// Write, fsync, and return the manifest entry describing the file
    pub async fn write(&self, dir: &Path) -> Result<ManifestEntry> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(Self::file_name(self.source, self.batch_number));
        let tmp = path.with_extension("json.partial");
        let bytes = serde_json::to_vec(self)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        Ok(ManifestEntry {
            source: self.source,
            batch_number: self.batch_number,
            path,
            start_token: self.start_token.clone(),
            record_count: self.record_count,
            checksum: medmirror_common::checksum::sha256_bytes(&bytes),
            downloaded_at: self.downloaded_at,
            processed: false,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// What a `download_all` call achieved
#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    pub batches: Vec<ManifestEntry>,
    pub records: usize,
    /// Stopped at the record limit rather than upstream exhaustion
    pub hit_limit: bool,
}

/// Drives a [`BatchSource`] against the persisted cursor
pub struct Downloader {
    source: Arc<dyn BatchSource>,
    tracker: Arc<StateTracker>,
    batch_dir: PathBuf,
    records_per_batch: usize,
    page_size: usize,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn BatchSource>,
        tracker: Arc<StateTracker>,
        batch_dir: impl Into<PathBuf>,
        records_per_batch: usize,
        page_size: usize,
    ) -> Self {
        let batch_dir = batch_dir.into().join(source.source().as_str());
        Self {
            source,
            tracker,
            batch_dir,
            records_per_batch,
            page_size,
        }
    }

    pub fn source(&self) -> Source {
        self.source.source()
    }

    /// Fetch one batch from `token`, write it, and record it in the manifest
    pub async fn download_batch(
        &self,
        token: Option<String>,
        page_size: usize,
        batch_number: u64,
        max_records: usize,
        since: Option<NaiveDate>,
    ) -> Result<(ManifestEntry, Option<String>)> {
        let source = self.source();
        let fetched = self
            .source
            .fetch_batch(token.as_deref(), max_records, page_size, since)
            .await?;

        let batch = BatchFile {
            source,
            batch_number,
            record_count: fetched.records.len(),
            upstream_calls: fetched.upstream_calls,
            start_token: token,
            next_token: fetched.next_token.clone(),
            downloaded_at: Utc::now(),
            records: fetched.records,
        };

        let entry = batch.write(&self.batch_dir).await?;
        self.tracker
            .record_batch(entry.clone(), fetched.next_token.clone())
            .await?;

        info!(
            source = %source,
            batch_number,
            records = entry.record_count,
            upstream_calls = batch.upstream_calls,
            "Batch written"
        );

        Ok((entry, fetched.next_token))
    }

    /// Download from the persisted cursor until upstream is exhausted
    ///
    /// `limit` caps the records downloaded in this run (including those
    /// already downloaded before a resume).
    pub async fn download_all(&self, limit: Option<usize>) -> Result<DownloadOutcome> {
        let source = self.source();
        let mut outcome = DownloadOutcome::default();

        let cursor = self
            .tracker
            .cursor(source)
            .await
            .ok_or_else(|| IngestError::state(format!("No cursor for {}; begin_run first", source)))?;

        if cursor.download_complete {
            return Ok(outcome);
        }

        let mut token = cursor.next_token.clone();
        let mut batch_number = cursor.last_batch_number;
        let mut downloaded = cursor.records_downloaded as usize;

        loop {
            let mut max_records = self.records_per_batch;
            if let Some(limit) = limit {
                if downloaded >= limit {
                    self.tracker.mark_download_complete(source).await?;
                    outcome.hit_limit = true;
                    info!(source = %source, limit, "Record limit reached");
                    break;
                }
                max_records = max_records.min(limit - downloaded);
            }

            batch_number += 1;
            let (entry, next) = self
                .download_batch(token, self.page_size, batch_number, max_records, cursor.window_start)
                .await?;

            downloaded += entry.record_count;
            outcome.records += entry.record_count;
            outcome.batches.push(entry);

            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(outcome)
    }

    /// Start or resume an incremental run covering the last `window_days`
    pub async fn download_recent(&self, window_days: i64, limit: Option<usize>) -> Result<DownloadOutcome> {
        let since = Utc::now().date_naive() - chrono::Duration::days(window_days);
        self.tracker
            .begin_run(self.source(), RunType::Incremental, Some(since))
            .await?;
        self.download_all(limit).await
    }
}

/// Check a manifest entry's file against its recorded checksum
///
/// A missing or mismatching file rewinds the cursor so the batch is fetched
/// again on the next run.
pub async fn verify_batch(tracker: &StateTracker, entry: &ManifestEntry) -> Result<bool> {
    let path = entry.path.clone();
    let expected = entry.checksum.clone();
    let verified =
        tokio::task::spawn_blocking(move || medmirror_common::checksum::verify_file(&path, &expected))
            .await?;

    match verified {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(
                source = %entry.source,
                batch_number = entry.batch_number,
                error = %e,
                "Batch file failed verification"
            );
            tracker.rewind_to(entry).await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_batch_file_write_is_self_describing() {
        let dir = TempDir::new().unwrap();
        let batch = BatchFile {
            source: Source::ClinicalTrials,
            batch_number: 3,
            record_count: 1,
            upstream_calls: 2,
            start_token: Some("abc".into()),
            next_token: Some("def".into()),
            downloaded_at: Utc::now(),
            records: vec![json!({"protocolSection": {}})],
        };

        let entry = batch.write(dir.path()).await.unwrap();
        assert_eq!(
            entry.path.file_name().unwrap().to_str().unwrap(),
            "clinical_trials_batch_000003.json"
        );
        assert_eq!(entry.checksum.len(), 64);
        assert!(medmirror_common::checksum::verify_file(&entry.path, &entry.checksum).is_ok());

        let back = BatchFile::read(&entry.path).unwrap();
        assert_eq!(back, batch);
    }
}
