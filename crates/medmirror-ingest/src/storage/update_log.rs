// update_log audit table
//
// One row per source per run. A row is opened as `in_progress` and closed
// exactly once; the table's trigger rejects later edits.

use crate::error::{IngestError, Result};
use crate::models::{RunStatus, RunType, Source, UpdateLogEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Counters reported when a run closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub files_processed: u64,
}

impl RunCounts {
    pub fn add(&mut self, other: &RunCounts) {
        self.records_processed += other.records_processed;
        self.records_skipped += other.records_skipped;
        self.records_failed += other.records_failed;
        self.files_processed += other.files_processed;
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub async fn start_run(pool: &PgPool, run_id: Uuid, source: Source, run_type: RunType) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO update_log (run_id, source, run_type, status)
        VALUES ($1, $2, $3, 'in_progress')
        RETURNING id
        "#,
    )
    .bind(run_id)
    .bind(source.as_str())
    .bind(run_type.as_str())
    .fetch_one(pool)
    .await?;

    Ok(id)
}

pub async fn finish_run(
    pool: &PgPool,
    id: i64,
    status: RunStatus,
    counts: &RunCounts,
    error_message: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE update_log
        SET status = $2,
            records_processed = $3,
            records_skipped = $4,
            records_failed = $5,
            files_processed = $6,
            completed_at = NOW(),
            error_message = $7
        WHERE id = $1 AND status = 'in_progress'
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(to_i64(counts.records_processed))
    .bind(to_i64(counts.records_skipped))
    .bind(to_i64(counts.records_failed))
    .bind(to_i64(counts.files_processed))
    .bind(error_message)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(IngestError::state(format!("update_log row {} is not open", id)));
    }
    Ok(())
}

fn entry_from_row(row: &PgRow) -> Result<UpdateLogEntry> {
    let run_type: String = row.try_get("run_type")?;
    let status: String = row.try_get("status")?;

    Ok(UpdateLogEntry {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        source: row.try_get("source")?,
        run_type: run_type.parse().map_err(IngestError::state)?,
        status: status.parse().map_err(IngestError::state)?,
        records_processed: row.try_get("records_processed")?,
        records_skipped: row.try_get("records_skipped")?,
        records_failed: row.try_get("records_failed")?,
        files_processed: row.try_get("files_processed")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

/// Most recent rows, newest first
pub async fn recent_runs(pool: &PgPool, limit: i64) -> Result<Vec<UpdateLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, run_id, source, run_type, status, records_processed, records_skipped,
               records_failed, files_processed, started_at, completed_at, error_message
        FROM update_log
        ORDER BY started_at DESC, id DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Aggregate over every source row of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub sources: Vec<UpdateLogEntry>,
}

/// Overall status of a run from its per-source statuses
///
/// Any failure fails the run; an open row keeps it in progress; a run that
/// only skipped sources is skipped.
pub fn overall_status(statuses: impl IntoIterator<Item = RunStatus>) -> Option<RunStatus> {
    let mut overall = None;
    for status in statuses {
        overall = Some(match (overall, status) {
            (_, RunStatus::Failed) | (Some(RunStatus::Failed), _) => RunStatus::Failed,
            (_, RunStatus::InProgress) | (Some(RunStatus::InProgress), _) => RunStatus::InProgress,
            (_, RunStatus::Success) | (Some(RunStatus::Success), _) => RunStatus::Success,
            _ => RunStatus::Skipped,
        });
    }
    overall
}

/// Summary of the most recently started run
pub async fn latest_run(pool: &PgPool) -> Result<Option<RunSummary>> {
    let run_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT run_id FROM update_log ORDER BY started_at DESC, id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(run_id) = run_id else {
        return Ok(None);
    };

    let rows = sqlx::query(
        r#"
        SELECT id, run_id, source, run_type, status, records_processed, records_skipped,
               records_failed, files_processed, started_at, completed_at, error_message
        FROM update_log
        WHERE run_id = $1
        ORDER BY source
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    let sources = rows.iter().map(entry_from_row).collect::<Result<Vec<_>>>()?;
    let Some(status) = overall_status(sources.iter().map(|e| e.status)) else {
        return Ok(None);
    };

    let mut counts = RunCounts::default();
    for entry in &sources {
        counts.add(&RunCounts {
            records_processed: entry.records_processed.max(0) as u64,
            records_skipped: entry.records_skipped.max(0) as u64,
            records_failed: entry.records_failed.max(0) as u64,
            files_processed: entry.files_processed.max(0) as u64,
        });
    }

    let started_at = sources.iter().map(|e| e.started_at).min().unwrap_or_else(Utc::now);
    let completed_at = if status == RunStatus::InProgress {
        None
    } else {
        sources.iter().filter_map(|e| e.completed_at).max()
    };

    Ok(Some(RunSummary {
        run_id,
        status,
        started_at,
        completed_at,
        counts,
        sources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        use RunStatus::*;
        assert_eq!(overall_status([]), None);
        assert_eq!(overall_status([Success, Skipped]), Some(Success));
        assert_eq!(overall_status([Skipped, Skipped]), Some(Skipped));
        assert_eq!(overall_status([Success, Failed, Skipped]), Some(Failed));
        assert_eq!(overall_status([Success, InProgress]), Some(InProgress));
        assert_eq!(overall_status([InProgress, Failed]), Some(Failed));
    }

    #[test]
    fn test_counts_add() {
        let mut total = RunCounts::default();
        total.add(&RunCounts {
            records_processed: 10,
            records_skipped: 1,
            records_failed: 0,
            files_processed: 2,
        });
        total.add(&RunCounts {
            records_processed: 5,
            records_skipped: 0,
            records_failed: 3,
            files_processed: 1,
        });
        assert_eq!(total.records_processed, 15);
        assert_eq!(total.records_failed, 3);
        assert_eq!(total.files_processed, 3);
    }
}
