// State Tracker
//
// In-memory view of the download state document. Every mutation is written
// through to the repository before the call returns.

use super::{DownloadState, ManifestEntry, SourceCursor, StateRepository};
use crate::error::Result;
use crate::models::{RunType, Source};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Retry-After hints are clamped to a week
const MAX_RETRY_AFTER_SECS: u64 = 7 * 24 * 3600;

pub struct StateTracker {
    repo: Arc<dyn StateRepository>,
    state: Mutex<DownloadState>,
}

impl StateTracker {
    /// Load persisted state and wrap it
    pub async fn open(repo: Arc<dyn StateRepository>) -> Result<Self> {
        let state = repo.load().await?;
        debug!(
            manifest_entries = state.manifest.len(),
            rate_limited_sources = state.retry_after.len(),
            "Download state loaded"
        );
        Ok(Self {
            repo,
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> DownloadState {
        self.state.lock().await.clone()
    }

    /// Persist the current document
    pub async fn save(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.persist(&mut state).await
    }

    /// Re-read the document from the repository, discarding in-memory state
    pub async fn reload(&self) -> Result<()> {
        let loaded = self.repo.load().await?;
        *self.state.lock().await = loaded;
        Ok(())
    }

    async fn persist(&self, state: &mut DownloadState) -> Result<()> {
        state.prune_retry_counts(Utc::now().date_naive());
        self.repo.save(state).await
    }

    // ========================================================================
    // Rate limiting
    // ========================================================================

    pub async fn is_rate_limited(&self, source: Source) -> bool {
        self.is_rate_limited_at(source, Utc::now()).await
    }

    pub async fn is_rate_limited_at(&self, source: Source, at: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .await
            .retry_after
            .get(&source)
            .is_some_and(|until| *until > at)
    }

    /// Expiry of an active rate limit, if any
    pub async fn rate_limited_until(&self, source: Source) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.state
            .lock()
            .await
            .retry_after
            .get(&source)
            .copied()
            .filter(|until| *until > now)
    }

    /// Block the source for `retry_after_seconds` from now
    ///
    /// An existing later expiry is kept.
    pub async fn set_rate_limit(&self, source: Source, retry_after_seconds: u64) -> Result<DateTime<Utc>> {
        let seconds = retry_after_seconds.min(MAX_RETRY_AFTER_SECS) as i64;
        let until = Utc::now() + chrono::Duration::seconds(seconds);

        let mut state = self.state.lock().await;
        let entry = state.retry_after.entry(source).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        let until = *entry;
        self.persist(&mut state).await?;

        warn!(source = %source, until = %until, retry_after_seconds, "Source rate limited");
        Ok(until)
    }

    // ========================================================================
    // Daily retry budget
    // ========================================================================

    pub async fn get_daily_retry_count(&self, source: Source) -> u32 {
        let today = Utc::now().date_naive();
        self.state
            .lock()
            .await
            .daily_retry_counts
            .get(&source)
            .and_then(|days| days.get(&today))
            .copied()
            .unwrap_or(0)
    }

    /// Count one failure against today's budget, returning the new total
    pub async fn increment_retry_count(&self, source: Source) -> Result<u32> {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock().await;
        let count = {
            let slot = state
                .daily_retry_counts
                .entry(source)
                .or_default()
                .entry(today)
                .or_insert(0);
            *slot += 1;
            *slot
        };
        self.persist(&mut state).await?;
        Ok(count)
    }

    // ========================================================================
    // Cursor and manifest
    // ========================================================================

    pub async fn cursor(&self, source: Source) -> Option<SourceCursor> {
        self.state.lock().await.last_batch_processed.get(&source).cloned()
    }

    /// Prepare the cursor for a run
    ///
    /// An interrupted run (download unfinished, or batch files not yet
    /// processed) is resumed as-is. A finished one is replaced with a fresh
    /// cursor of the requested type.
    pub async fn begin_run(
        &self,
        source: Source,
        run_type: RunType,
        window_start: Option<NaiveDate>,
    ) -> Result<SourceCursor> {
        let mut state = self.state.lock().await;

        let has_pending = state
            .manifest
            .iter()
            .any(|e| e.source == source && !e.processed);

        let cursor = match state.last_batch_processed.get(&source) {
            Some(existing) if !existing.download_complete || has_pending => {
                info!(
                    source = %source,
                    last_batch_number = existing.last_batch_number,
                    download_complete = existing.download_complete,
                    "Resuming interrupted run"
                );
                existing.clone()
            }
            _ => SourceCursor::fresh(run_type, window_start),
        };

        state.last_batch_processed.insert(source, cursor.clone());
        self.persist(&mut state).await?;
        Ok(cursor)
    }

    /// Register a batch file that has been written and synced to disk
    ///
    /// Advances the cursor to `next_token`; `None` marks the download
    /// complete.
    pub async fn record_batch(&self, entry: ManifestEntry, next_token: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let source = entry.source;
        let batch_number = entry.batch_number;
        let records = entry.record_count as u64;

        let cursor = state
            .last_batch_processed
            .entry(source)
            .or_insert_with(|| SourceCursor::fresh(RunType::Full, None));
        cursor.last_batch_number = cursor.last_batch_number.max(batch_number);
        cursor.download_complete = next_token.is_none();
        cursor.next_token = next_token;
        cursor.records_downloaded += records;

        state
            .manifest
            .retain(|e| !(e.source == source && e.batch_number == batch_number));
        state.manifest.push(entry);

        self.persist(&mut state).await
    }

    /// Stop downloading this run even though upstream has more
    pub async fn mark_download_complete(&self, source: Source) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(cursor) = state.last_batch_processed.get_mut(&source) {
            cursor.download_complete = true;
        }
        self.persist(&mut state).await
    }

    /// Unprocessed batch files for a source, in batch order
    pub async fn pending_batches(&self, source: Source) -> Vec<ManifestEntry> {
        let state = self.state.lock().await;
        let mut pending: Vec<ManifestEntry> = state
            .manifest
            .iter()
            .filter(|e| e.source == source && !e.processed)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.batch_number);
        pending
    }

    pub async fn mark_processed(&self, source: Source, batch_number: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .manifest
            .iter_mut()
            .find(|e| e.source == source && e.batch_number == batch_number)
        {
            entry.processed = true;
        }
        self.persist(&mut state).await
    }

    /// Forget a damaged batch file and everything downloaded after it
    ///
    /// The cursor is rewound to the token the batch started from, so the next
    /// run downloads it again.
    pub async fn rewind_to(&self, entry: &ManifestEntry) -> Result<Vec<ManifestEntry>> {
        let mut state = self.state.lock().await;

        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.manifest)
            .into_iter()
            .partition(|e| e.source == entry.source && e.batch_number >= entry.batch_number);
        state.manifest = kept;

        if let Some(cursor) = state.last_batch_processed.get_mut(&entry.source) {
            cursor.next_token = entry.start_token.clone();
            cursor.last_batch_number = entry.batch_number.saturating_sub(1);
            cursor.download_complete = false;
            cursor.records_downloaded = cursor
                .records_downloaded
                .saturating_sub(dropped.iter().map(|e| e.record_count as u64).sum());
        }

        self.persist(&mut state).await?;
        warn!(
            source = %entry.source,
            batch_number = entry.batch_number,
            dropped = dropped.len(),
            "Rewound download cursor"
        );
        Ok(dropped)
    }

    /// Remove processed entries after a clean run, returning them
    pub async fn prune_processed(&self, source: Source) -> Result<Vec<ManifestEntry>> {
        let mut state = self.state.lock().await;
        let (pruned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.manifest)
            .into_iter()
            .partition(|e| e.source == source && e.processed);
        state.manifest = kept;
        self.persist(&mut state).await?;
        Ok(pruned)
    }
}
