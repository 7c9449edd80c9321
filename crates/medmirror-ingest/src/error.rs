// Ingestion error taxonomy
//
// Per-record problems never reach this type: the parser reports them as
// `RecordOutcome::Skipped`. Everything here is either batch-scoped
// (deadlocks), source-scoped (rate limits, retry budget) or run-scoped
// (configuration, state durability).

use crate::models::Source;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for the mirroring pipeline
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network failure or 5xx that outlived the per-request attempt cap
    #[error("Transient network error from {source_name}: {message}")]
    TransientNetwork { source_name: Source, message: String },

    /// Upstream asked us to back off until `until`
    #[error("{source_name} is rate limited until {until}")]
    RateLimited {
        source_name: Source,
        until: DateTime<Utc>,
    },

    /// The day's retry budget for a source is spent
    #[error("{source_name} exhausted its daily retry budget ({count} retries)")]
    RetryBudgetExhausted { source_name: Source, count: u32 },

    /// Upsert kept deadlocking past the attempt ceiling
    #[error("Batch upsert deadlocked {attempts} times, giving up")]
    Deadlock { attempts: u32 },

    /// Missing or invalid configuration, or no reachable data store
    #[error("Configuration error: {0}")]
    FatalConfiguration(String),

    /// Durable state could not be read or written
    #[error("State store error: {0}")]
    State(String),

    /// Upstream returned something we cannot use (non-retryable status, bad body)
    #[error("Upstream error from {source_name}: {message}")]
    Upstream { source_name: Source, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Delimited text error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Common(#[from] medmirror_common::MirrorError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::FatalConfiguration(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Errors that end a source's run as `skipped` rather than `failed`
    pub fn is_source_skip(&self) -> bool {
        matches!(
            self,
            IngestError::RateLimited { .. } | IngestError::RetryBudgetExhausted { .. }
        )
    }

    /// Errors that abort the whole run, not just one source
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::FatalConfiguration(_)
                | IngestError::State(_)
                | IngestError::Migration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_classification() {
        let limited = IngestError::RateLimited {
            source_name: Source::ClinicalTrials,
            until: Utc::now(),
        };
        let budget = IngestError::RetryBudgetExhausted {
            source_name: Source::DrugLabels,
            count: 50,
        };
        let network = IngestError::TransientNetwork {
            source_name: Source::ClinicalTrials,
            message: "connection reset".to_string(),
        };

        assert!(limited.is_source_skip());
        assert!(budget.is_source_skip());
        assert!(!network.is_source_skip());
        assert!(!IngestError::Deadlock { attempts: 5 }.is_source_skip());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(IngestError::config("DATABASE_URL not set").is_fatal());
        assert!(IngestError::state("disk full").is_fatal());
        assert!(!IngestError::Deadlock { attempts: 5 }.is_fatal());
    }
}
