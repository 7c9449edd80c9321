//! Durable download state
//!
//! One document holds everything a restarted process needs to resume:
//! per-source rate-limit expiry, per-day retry counters, the pagination
//! cursor of the current run and the manifest of batch files written so far.
//!
//! ```json
//! {
//!   "retry_after": { "clinical_trials": "2024-05-01T12:02:00Z" },
//!   "daily_retry_counts": { "clinical_trials": { "2024-05-01": 3 } },
//!   "last_batch_processed": { "clinical_trials": { "next_token": "abc", "last_batch_number": 4, ... } },
//!   "manifest": [ { "source": "clinical_trials", "batch_number": 1, ... } ]
//! }
//! ```

pub mod repository;
pub mod tracker;

pub use repository::{FileStateRepository, PgStateRepository, StateRepository};
pub use tracker::StateTracker;

use crate::models::{RunType, Source};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Retry counters older than this many days are dropped on save
pub const RETRY_COUNT_RETENTION_DAYS: i64 = 7;

/// The persisted state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    #[serde(default)]
    pub retry_after: BTreeMap<Source, DateTime<Utc>>,
    #[serde(default)]
    pub daily_retry_counts: BTreeMap<Source, BTreeMap<NaiveDate, u32>>,
    #[serde(default)]
    pub last_batch_processed: BTreeMap<Source, SourceCursor>,
    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,
}

/// Where a source's download stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCursor {
    /// Continuation token for the next upstream request; `None` means start
    pub next_token: Option<String>,
    pub last_batch_number: u64,
    pub download_complete: bool,
    pub run_type: RunType,
    /// Lower bound on upstream modification date for incremental runs
    #[serde(default)]
    pub window_start: Option<NaiveDate>,
    pub records_downloaded: u64,
    pub started_at: DateTime<Utc>,
}

impl SourceCursor {
    pub fn fresh(run_type: RunType, window_start: Option<NaiveDate>) -> Self {
        Self {
            next_token: None,
            last_batch_number: 0,
            download_complete: false,
            run_type,
            window_start,
            records_downloaded: 0,
            started_at: Utc::now(),
        }
    }
}

/// A batch file that reached durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source: Source,
    pub batch_number: u64,
    pub path: PathBuf,
    /// Token the first upstream request of this batch was issued with
    pub start_token: Option<String>,
    pub record_count: usize,
    /// SHA-256 of the file bytes, verified before parsing on resume
    pub checksum: String,
    pub downloaded_at: DateTime<Utc>,
    /// Set once every storage batch built from this file committed
    pub processed: bool,
}

impl DownloadState {
    /// Drop retry counters outside the retention window
    pub fn prune_retry_counts(&mut self, today: NaiveDate) {
        let cutoff = today - chrono::Duration::days(RETRY_COUNT_RETENTION_DAYS);
        for counts in self.daily_retry_counts.values_mut() {
            counts.retain(|day, _| *day > cutoff);
        }
        self.daily_retry_counts.retain(|_, counts| !counts.is_empty());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_document_shape() {
        let mut state = DownloadState::default();
        state.retry_after.insert(
            Source::ClinicalTrials,
            "2024-05-01T12:02:00Z".parse().unwrap(),
        );
        state
            .daily_retry_counts
            .entry(Source::ClinicalTrials)
            .or_default()
            .insert(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 3);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["retry_after"]["clinical_trials"], "2024-05-01T12:02:00Z");
        assert_eq!(json["daily_retry_counts"]["clinical_trials"]["2024-05-01"], 3);

        let back: DownloadState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_missing_sections_default() {
        let state: DownloadState = serde_json::from_str("{}").unwrap();
        assert!(state.manifest.is_empty());
        assert!(state.retry_after.is_empty());
    }

    #[test]
    fn test_prune_retry_counts() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let mut state = DownloadState::default();
        let counts = state.daily_retry_counts.entry(Source::DrugLabels).or_default();
        counts.insert(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 4);
        counts.insert(NaiveDate::from_ymd_opt(2024, 5, 9).unwrap(), 2);
        state
            .daily_retry_counts
            .entry(Source::OrangeBook)
            .or_default()
            .insert(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(), 1);

        state.prune_retry_counts(today);

        let labels = &state.daily_retry_counts[&Source::DrugLabels];
        assert_eq!(labels.len(), 1);
        assert!(!state.daily_retry_counts.contains_key(&Source::OrangeBook));
    }
}
