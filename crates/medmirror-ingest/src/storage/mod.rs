//! Storage/upsert layer
//!
//! Canonical records are written in fixed-size chunks. Every chunk is its own
//! transaction on its own pooled connection, executed by a bounded pool of
//! storage workers, so a chunk that fails (after deadlock retries) leaves the
//! others untouched. The `ON CONFLICT` clauses call the `mirror_*` SQL
//! functions, which implement the same field policy as [`crate::merge`].

pub mod queries;
pub mod retry;
pub mod rows;
pub mod search_index;
pub mod update_log;

pub use queries::{MirrorCounts, SearchFilter, SearchHit};
pub use retry::{retry_on_deadlock, DeadlockPolicy};
pub use rows::{prepare_row, Row};
pub use search_index::{rebuild_search_index, IndexReport};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::merge::Mergeable;
use crate::models::{CanonicalRecord, DrugRecord, TrialRecord};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Outcome of one [`MirrorStore::batch_upsert`] call
#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    /// Chunks submitted
    pub chunks: usize,
    pub rows_written: usize,
    /// Rows in chunks that failed terminally
    pub rows_failed: usize,
    /// Records dropped by `prepare_row`
    pub rows_rejected: usize,
    pub failures: Vec<ChunkFailure>,
}

impl UpsertReport {
    pub fn all_committed(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub chunk: String,
    pub rows: usize,
    pub error: String,
}

enum Chunk {
    Trials(Vec<TrialRecord>),
    Drugs(Vec<DrugRecord>),
}

impl Chunk {
    fn len(&self) -> usize {
        match self {
            Chunk::Trials(rows) => rows.len(),
            Chunk::Drugs(rows) => rows.len(),
        }
    }
}

/// Handle on the canonical tables
#[derive(Clone)]
pub struct MirrorStore {
    pool: PgPool,
    chunk_size: usize,
    workers: usize,
    deadlock: DeadlockPolicy,
}

impl MirrorStore {
    pub fn new(pool: PgPool, workers: &WorkerConfig) -> Self {
        Self {
            pool,
            chunk_size: workers.upsert_batch_size.max(1),
            workers: workers.storage_workers.max(1),
            deadlock: DeadlockPolicy::from_config(workers),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert canonical records
    ///
    /// Records are normalized with [`prepare_row`], records sharing a key
    /// are merged, and each domain's rows are sorted by key before chunking
    /// so concurrent chunks acquire row locks in a stable order. The call
    /// returns once every chunk has committed or failed.
    pub async fn batch_upsert(&self, records: Vec<CanonicalRecord>) -> UpsertReport {
        let mut report = UpsertReport::default();
        let mut trials: BTreeMap<String, TrialRecord> = BTreeMap::new();
        let mut drugs: BTreeMap<String, DrugRecord> = BTreeMap::new();

        for record in records {
            match prepare_row(record) {
                Some(Row::Trial(row)) => match trials.get_mut(&row.nct_id) {
                    Some(existing) => *existing = existing.merged(&row),
                    None => {
                        trials.insert(row.nct_id.clone(), row);
                    }
                },
                Some(Row::Drug(row)) => match drugs.get_mut(&row.generic_name) {
                    Some(existing) => *existing = existing.merged(&row),
                    None => {
                        drugs.insert(row.generic_name.clone(), row);
                    }
                },
                None => report.rows_rejected += 1,
            }
        }

        let trials: Vec<TrialRecord> = trials.into_values().collect();
        let drugs: Vec<DrugRecord> = drugs.into_values().collect();

        let mut chunks = Vec::new();
        for chunk in trials.chunks(self.chunk_size) {
            chunks.push(Chunk::Trials(chunk.to_vec()));
        }
        for chunk in drugs.chunks(self.chunk_size) {
            chunks.push(Chunk::Drugs(chunk.to_vec()));
        }
        report.chunks = chunks.len();

        if chunks.is_empty() {
            return report;
        }

        info!(
            trials = trials.len(),
            drugs = drugs.len(),
            chunks = chunks.len(),
            workers = self.workers,
            "Upserting canonical records"
        );

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let pool = self.pool.clone();
            let policy = self.deadlock;
            tasks.spawn(async move {
                let label = match &chunk {
                    Chunk::Trials(_) => format!("trials#{}", index),
                    Chunk::Drugs(_) => format!("drugs#{}", index),
                };
                let rows = chunk.len();
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => upsert_chunk(&pool, &policy, &label, &chunk).await,
                    Err(e) => Err(crate::error::IngestError::state(e.to_string())),
                };
                (label, rows, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((label, rows, Ok(()))) => {
                    debug!(chunk = %label, records = rows, "Chunk committed");
                    report.rows_written += rows;
                }
                Ok((label, rows, Err(e))) => {
                    error!(chunk = %label, records = rows, error = %e, "Chunk failed");
                    report.rows_failed += rows;
                    report.failures.push(ChunkFailure {
                        chunk: label,
                        rows,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "Storage worker panicked");
                    report.failures.push(ChunkFailure {
                        chunk: "unknown".to_string(),
                        rows: 0,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            written = report.rows_written,
            failed = report.rows_failed,
            rejected = report.rows_rejected,
            "Upsert finished"
        );

        report
    }
}

async fn upsert_chunk(pool: &PgPool, policy: &DeadlockPolicy, label: &str, chunk: &Chunk) -> Result<()> {
    retry_on_deadlock(policy, label, || async {
        let mut tx = pool.begin().await?;
        match chunk {
            Chunk::Trials(rows) => upsert_trials(&mut tx, rows).await?,
            Chunk::Drugs(rows) => upsert_drugs(&mut tx, rows).await?,
        }
        tx.commit().await
    })
    .await
}

async fn upsert_trials(tx: &mut sqlx::Transaction<'_, Postgres>, rows: &[TrialRecord]) -> sqlx::Result<()> {
    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        INSERT INTO clinical_trials AS t (
            nct_id,
            brief_title,
            official_title,
            brief_summary,
            detailed_description,
            overall_status,
            phase,
            study_type,
            start_date,
            completion_date,
            eligibility_criteria,
            conditions,
            interventions,
            locations,
            sponsors,
            keywords,
            has_results,
            confidence_score,
            data_sources
        )
        "#,
    );

    query_builder.push_values(rows, |mut b, trial| {
        b.push_bind(&trial.nct_id)
            .push_bind(&trial.brief_title)
            .push_bind(&trial.official_title)
            .push_bind(&trial.brief_summary)
            .push_bind(&trial.detailed_description)
            .push_bind(&trial.overall_status)
            .push_bind(&trial.phase)
            .push_bind(&trial.study_type)
            .push_bind(&trial.start_date)
            .push_bind(&trial.completion_date)
            .push_bind(&trial.eligibility_criteria)
            .push_bind(&trial.conditions)
            .push_bind(&trial.interventions)
            .push_bind(&trial.locations)
            .push_bind(&trial.sponsors)
            .push_bind(&trial.keywords)
            .push_bind(trial.has_results)
            .push_bind(trial.confidence_score)
            .push_bind(&trial.data_sources);
    });

    query_builder.push(
        r#"
        ON CONFLICT (nct_id)
        DO UPDATE SET
            brief_title = mirror_prefer_longer(t.brief_title, EXCLUDED.brief_title),
            official_title = mirror_prefer_longer(t.official_title, EXCLUDED.official_title),
            brief_summary = mirror_prefer_longer(t.brief_summary, EXCLUDED.brief_summary),
            detailed_description = mirror_prefer_longer(t.detailed_description, EXCLUDED.detailed_description),
            overall_status = mirror_prefer_longer(t.overall_status, EXCLUDED.overall_status),
            phase = mirror_prefer_longer(t.phase, EXCLUDED.phase),
            study_type = mirror_prefer_longer(t.study_type, EXCLUDED.study_type),
            start_date = mirror_prefer_longer(t.start_date, EXCLUDED.start_date),
            completion_date = mirror_prefer_longer(t.completion_date, EXCLUDED.completion_date),
            eligibility_criteria = mirror_prefer_longer(t.eligibility_criteria, EXCLUDED.eligibility_criteria),
            conditions = mirror_union_text(t.conditions, EXCLUDED.conditions),
            interventions = mirror_union_text(t.interventions, EXCLUDED.interventions),
            locations = mirror_union_text(t.locations, EXCLUDED.locations),
            sponsors = mirror_union_text(t.sponsors, EXCLUDED.sponsors),
            keywords = mirror_union_text(t.keywords, EXCLUDED.keywords),
            has_results = t.has_results OR EXCLUDED.has_results,
            confidence_score = GREATEST(t.confidence_score, EXCLUDED.confidence_score),
            data_sources = mirror_union_text(t.data_sources, EXCLUDED.data_sources)
        "#,
    );

    query_builder.build().execute(&mut **tx).await?;
    Ok(())
}

async fn upsert_drugs(tx: &mut sqlx::Transaction<'_, Postgres>, rows: &[DrugRecord]) -> sqlx::Result<()> {
    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        INSERT INTO drugs AS d (
            generic_name,
            brand_names,
            manufacturers,
            active_ingredients,
            routes,
            therapeutic_class,
            mechanism_of_action,
            indications,
            contraindications,
            warnings,
            dosage_and_administration,
            formulations,
            interactions,
            has_label_text,
            has_therapeutic_equivalent,
            confidence_score,
            data_sources
        )
        "#,
    );

    query_builder.push_values(rows, |mut b, drug| {
        b.push_bind(&drug.generic_name)
            .push_bind(&drug.brand_names)
            .push_bind(&drug.manufacturers)
            .push_bind(&drug.active_ingredients)
            .push_bind(&drug.routes)
            .push_bind(&drug.therapeutic_class)
            .push_bind(&drug.mechanism_of_action)
            .push_bind(&drug.indications)
            .push_bind(&drug.contraindications)
            .push_bind(&drug.warnings)
            .push_bind(&drug.dosage_and_administration)
            .push_bind(Json(&drug.formulations))
            .push_bind(Json(&drug.interactions))
            .push_bind(drug.has_label_text)
            .push_bind(drug.has_therapeutic_equivalent)
            .push_bind(drug.confidence_score)
            .push_bind(&drug.data_sources);
    });

    query_builder.push(
        r#"
        ON CONFLICT (generic_name)
        DO UPDATE SET
            brand_names = mirror_union_text(d.brand_names, EXCLUDED.brand_names),
            manufacturers = mirror_union_text(d.manufacturers, EXCLUDED.manufacturers),
            active_ingredients = mirror_union_text(d.active_ingredients, EXCLUDED.active_ingredients),
            routes = mirror_union_text(d.routes, EXCLUDED.routes),
            therapeutic_class = mirror_prefer_longer(d.therapeutic_class, EXCLUDED.therapeutic_class),
            mechanism_of_action = mirror_prefer_longer(d.mechanism_of_action, EXCLUDED.mechanism_of_action),
            indications = mirror_prefer_longer(d.indications, EXCLUDED.indications),
            contraindications = mirror_prefer_longer(d.contraindications, EXCLUDED.contraindications),
            warnings = mirror_prefer_longer(d.warnings, EXCLUDED.warnings),
            dosage_and_administration = mirror_prefer_longer(d.dosage_and_administration, EXCLUDED.dosage_and_administration),
            formulations = mirror_merge_formulations(d.formulations, EXCLUDED.formulations),
            interactions = d.interactions || EXCLUDED.interactions,
            has_label_text = d.has_label_text OR EXCLUDED.has_label_text,
            has_therapeutic_equivalent = d.has_therapeutic_equivalent OR EXCLUDED.has_therapeutic_equivalent,
            confidence_score = GREATEST(d.confidence_score, EXCLUDED.confidence_score),
            data_sources = mirror_union_text(d.data_sources, EXCLUDED.data_sources)
        "#,
    );

    query_builder.build().execute(&mut **tx).await?;
    Ok(())
}
