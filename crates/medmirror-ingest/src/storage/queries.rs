// Read side of the mirror: search, point lookup and counts

use crate::error::Result;
use crate::merge::identity::{drug_key, trial_key};
use crate::models::{CanonicalRecord, Domain, DrugRecord, TrialRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

pub const TRIAL_COLUMNS: &str = "nct_id, brief_title, official_title, brief_summary, \
    detailed_description, overall_status, phase, study_type, start_date, completion_date, \
    eligibility_criteria, conditions, interventions, locations, sponsors, keywords, has_results, \
    confidence_score, data_sources";

pub const DRUG_COLUMNS: &str = "generic_name, brand_names, manufacturers, active_ingredients, \
    routes, therapeutic_class, mechanism_of_action, indications, contraindications, warnings, \
    dosage_and_administration, formulations, interactions, has_label_text, \
    has_therapeutic_equivalent, confidence_score, data_sources";

/// Search criteria; every set field must match
///
/// `conditions` and `status` only exist on trials and `manufacturer` only on
/// drugs, so setting one of them excludes the other domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    pub domain: Option<Domain>,
    /// Free text, matched against the search vector
    pub text: Option<String>,
    /// Substring match against any condition, case-insensitive
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Exact overall status, case-insensitive
    pub status: Option<String>,
    /// Substring match against any manufacturer, case-insensitive
    pub manufacturer: Option<String>,
}

impl SearchFilter {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn search_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    fn includes(&self, domain: Domain) -> bool {
        if self.domain.is_some_and(|d| d != domain) {
            return false;
        }
        match domain {
            Domain::Trials => self.manufacturer.is_none(),
            Domain::Drugs => self.conditions.is_empty() && self.status.is_none(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub rank: f32,
    pub record: CanonicalRecord,
}

#[derive(sqlx::FromRow)]
struct RankedTrial {
    #[sqlx(flatten)]
    record: TrialRecord,
    rank: f32,
}

#[derive(sqlx::FromRow)]
struct RankedDrug {
    #[sqlx(flatten)]
    record: DrugRecord,
    rank: f32,
}

fn push_rank_and_match(qb: &mut QueryBuilder<'_, Postgres>, table: &str, text: Option<&str>) {
    match text {
        Some(text) => {
            qb.push(", ts_rank_cd(search_vector, plainto_tsquery('english', ");
            qb.push_bind(text.to_string());
            qb.push(")) AS rank FROM ");
            qb.push(table);
            qb.push(" WHERE search_vector @@ plainto_tsquery('english', ");
            qb.push_bind(text.to_string());
            qb.push(")");
        }
        None => {
            qb.push(", 0::real AS rank FROM ");
            qb.push(table);
            qb.push(" WHERE TRUE");
        }
    }
}

fn push_any_contains(qb: &mut QueryBuilder<'_, Postgres>, column: &str, needle: &str) {
    qb.push(" AND EXISTS (SELECT 1 FROM unnest(");
    qb.push(column);
    qb.push(") AS item(value) WHERE strpos(lower(item.value), lower(");
    qb.push_bind(needle.to_string());
    qb.push(")) > 0)");
}

async fn search_trials(pool: &PgPool, filter: &SearchFilter, limit: i64) -> Result<Vec<SearchHit>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
    qb.push(TRIAL_COLUMNS);
    push_rank_and_match(&mut qb, "clinical_trials", filter.search_text());

    for condition in filter.conditions.iter().filter(|c| !c.trim().is_empty()) {
        push_any_contains(&mut qb, "conditions", condition.trim());
    }
    if let Some(status) = &filter.status {
        qb.push(" AND lower(overall_status) = lower(");
        qb.push_bind(status.trim().to_string());
        qb.push(")");
    }

    qb.push(" ORDER BY rank DESC, nct_id LIMIT ");
    qb.push_bind(limit);

    let rows = qb.build_query_as::<RankedTrial>().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|r| SearchHit {
            rank: r.rank,
            record: CanonicalRecord::Trial(r.record),
        })
        .collect())
}

async fn search_drugs(pool: &PgPool, filter: &SearchFilter, limit: i64) -> Result<Vec<SearchHit>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
    qb.push(DRUG_COLUMNS);
    push_rank_and_match(&mut qb, "drugs", filter.search_text());

    if let Some(manufacturer) = filter.manufacturer.as_deref().filter(|m| !m.trim().is_empty()) {
        push_any_contains(&mut qb, "manufacturers", manufacturer.trim());
    }

    qb.push(" ORDER BY rank DESC, generic_name LIMIT ");
    qb.push_bind(limit);

    let rows = qb.build_query_as::<RankedDrug>().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|r| SearchHit {
            rank: r.rank,
            record: CanonicalRecord::Drug(r.record),
        })
        .collect())
}

/// Ranked search across the selected domains
///
/// With no text, results are ordered by identity key.
pub async fn search(pool: &PgPool, filter: &SearchFilter, max_results: usize) -> Result<Vec<SearchHit>> {
    if max_results == 0 {
        return Ok(Vec::new());
    }
    let limit = i64::try_from(max_results).unwrap_or(i64::MAX);

    let mut hits = Vec::new();
    if filter.includes(Domain::Trials) {
        hits.extend(search_trials(pool, filter, limit).await?);
    }
    if filter.includes(Domain::Drugs) {
        hits.extend(search_drugs(pool, filter, limit).await?);
    }

    hits.sort_by(|a, b| {
        b.rank
            .total_cmp(&a.rank)
            .then_with(|| a.record.identity_key().cmp(b.record.identity_key()))
    });
    hits.truncate(max_results);
    Ok(hits)
}

/// Point lookup by identity key
///
/// The key is normalized the same way ingestion normalizes it, so
/// `"albuterol"` finds `"ALBUTEROL"`.
pub async fn get_record(pool: &PgPool, domain: Domain, key: &str) -> Result<Option<CanonicalRecord>> {
    match domain {
        Domain::Trials => {
            let Some(key) = trial_key(key) else {
                return Ok(None);
            };
            let record = sqlx::query_as::<_, TrialRecord>(&format!(
                "SELECT {} FROM clinical_trials WHERE nct_id = $1",
                TRIAL_COLUMNS
            ))
            .bind(key)
            .fetch_optional(pool)
            .await?;
            Ok(record.map(CanonicalRecord::Trial))
        }
        Domain::Drugs => {
            let Some(key) = drug_key(key) else {
                return Ok(None);
            };
            let record = sqlx::query_as::<_, DrugRecord>(&format!(
                "SELECT {} FROM drugs WHERE generic_name = $1",
                DRUG_COLUMNS
            ))
            .bind(key)
            .fetch_optional(pool)
            .await?;
            Ok(record.map(CanonicalRecord::Drug))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorCounts {
    pub trials: i64,
    pub drugs: i64,
}

impl MirrorCounts {
    pub fn total(&self) -> i64 {
        self.trials + self.drugs
    }
}

pub async fn count_records(pool: &PgPool) -> Result<MirrorCounts> {
    let (trials, drugs): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM clinical_trials),
            (SELECT COUNT(*) FROM drugs)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(MirrorCounts { trials, drugs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_domain_selection() {
        let all = SearchFilter::text("asthma");
        assert!(all.includes(Domain::Trials));
        assert!(all.includes(Domain::Drugs));

        let by_condition = SearchFilter {
            conditions: vec!["asthma".into()],
            ..Default::default()
        };
        assert!(by_condition.includes(Domain::Trials));
        assert!(!by_condition.includes(Domain::Drugs));

        let by_manufacturer = SearchFilter {
            manufacturer: Some("GSK".into()),
            ..Default::default()
        };
        assert!(!by_manufacturer.includes(Domain::Trials));
        assert!(by_manufacturer.includes(Domain::Drugs));

        let drugs_only = SearchFilter {
            domain: Some(Domain::Drugs),
            ..SearchFilter::text("albuterol")
        };
        assert!(!drugs_only.includes(Domain::Trials));
    }

    #[test]
    fn test_blank_text_is_no_text() {
        assert_eq!(SearchFilter::text("  ").search_text(), None);
        assert_eq!(SearchFilter::text(" asthma ").search_text(), Some("asthma"));
    }
}
