// Full-text search index maintenance
//
// Rebuilds are serialized across processes with a transaction-scoped
// advisory lock. Only rows changed since their last indexing are touched.

use crate::error::Result;
use serde::Serialize;
use sqlx::PgPool;
use std::time::Instant;
use tracing::info;

/// Advisory lock name shared by every rebuild
pub const SEARCH_INDEX_LOCK: &str = "medmirror_search_index";

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IndexReport {
    pub trials_indexed: u64,
    pub drugs_indexed: u64,
}

const REINDEX_TRIALS: &str = r#"
    UPDATE clinical_trials
    SET
        search_vector =
            setweight(to_tsvector('english',
                nct_id || ' ' || coalesce(brief_title, '') || ' ' || coalesce(official_title, '')), 'A')
            || setweight(to_tsvector('english',
                array_to_string(conditions || interventions || keywords || sponsors, ' ')), 'B')
            || setweight(to_tsvector('english',
                coalesce(brief_summary, '') || ' ' || coalesce(detailed_description, '')), 'C'),
        indexed_at = clock_timestamp()
    WHERE indexed_at IS NULL OR indexed_at < updated_at
"#;

const REINDEX_DRUGS: &str = r#"
    UPDATE drugs
    SET
        search_vector =
            setweight(to_tsvector('english',
                generic_name || ' ' || array_to_string(brand_names, ' ')), 'A')
            || setweight(to_tsvector('english',
                array_to_string(active_ingredients || manufacturers, ' ') || ' ' || coalesce(therapeutic_class, '')), 'B')
            || setweight(to_tsvector('english',
                coalesce(indications, '') || ' ' || coalesce(mechanism_of_action, '') || ' ' || coalesce(warnings, '')), 'C'),
        indexed_at = clock_timestamp()
    WHERE indexed_at IS NULL OR indexed_at < updated_at
"#;

/// Recompute search vectors for stale rows
///
/// Blocks until no other rebuild holds the lock; the lock is released when
/// the transaction ends.
pub async fn rebuild_search_index(pool: &PgPool) -> Result<IndexReport> {
    let started = Instant::now();
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
        .bind(SEARCH_INDEX_LOCK)
        .execute(&mut *tx)
        .await?;

    let trials_indexed = sqlx::query(REINDEX_TRIALS).execute(&mut *tx).await?.rows_affected();
    let drugs_indexed = sqlx::query(REINDEX_DRUGS).execute(&mut *tx).await?.rows_affected();

    tx.commit().await?;

    info!(
        trials = trials_indexed,
        drugs = drugs_indexed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Search index rebuilt"
    );

    Ok(IndexReport {
        trials_indexed,
        drugs_indexed,
    })
}
