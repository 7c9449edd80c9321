// Row preparation for the upsert
//
// A row is a canonical record normalized the way the upsert's SQL merge
// expressions would leave it: identity key recomputed, lists deduplicated,
// blank text cleared. Normalizing by merging into an empty record keeps the
// insert path and the conflict path on the same policy.

use crate::merge::identity::{drug_key, trial_key};
use crate::merge::Mergeable;
use crate::models::{CanonicalRecord, Domain, DrugRecord, TrialRecord};
use tracing::debug;

/// A record ready to be bound into an upsert statement
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Trial(TrialRecord),
    Drug(DrugRecord),
}

impl Row {
    pub fn domain(&self) -> Domain {
        match self {
            Row::Trial(_) => Domain::Trials,
            Row::Drug(_) => Domain::Drugs,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Row::Trial(t) => &t.nct_id,
            Row::Drug(d) => &d.generic_name,
        }
    }
}

/// Normalize a record for storage
///
/// Returns `None` (and logs) when no usable identity key can be derived.
pub fn prepare_row(record: CanonicalRecord) -> Option<Row> {
    match record {
        CanonicalRecord::Trial(trial) => {
            let Some(key) = trial_key(&trial.nct_id) else {
                debug!(domain = "trials", "Row without registry id rejected");
                return None;
            };
            let empty = TrialRecord {
                nct_id: key,
                ..Default::default()
            };
            Some(Row::Trial(empty.merged(&trial)))
        }
        CanonicalRecord::Drug(drug) => {
            let Some(key) = drug_key(&drug.generic_name) else {
                debug!(domain = "drugs", "Row without generic name rejected");
                return None;
            };
            let empty = DrugRecord {
                generic_name: key,
                ..Default::default()
            };
            Some(Row::Drug(empty.merged(&drug)))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::Formulation;

    #[test]
    fn test_prepare_row_normalizes_key_and_lists() {
        let record = CanonicalRecord::Trial(TrialRecord {
            nct_id: " nct0001 ".into(),
            conditions: vec!["Asthma".into(), "asthma".into(), " ".into()],
            brief_title: Some("   ".into()),
            ..Default::default()
        });

        let Row::Trial(row) = prepare_row(record).unwrap() else {
            panic!("expected trial row");
        };
        assert_eq!(row.nct_id, "NCT0001");
        assert_eq!(row.conditions, vec!["Asthma"]);
        assert_eq!(row.brief_title, None);
    }

    #[test]
    fn test_prepare_row_rejects_missing_identity() {
        let record = CanonicalRecord::Drug(DrugRecord {
            generic_name: "  ".into(),
            brand_names: vec!["Ventolin".into()],
            ..Default::default()
        });
        assert!(prepare_row(record).is_none());
    }

    #[test]
    fn test_prepare_row_is_stable() {
        let record = CanonicalRecord::Drug(DrugRecord {
            generic_name: "albuterol  sulfate".into(),
            formulations: vec![
                Formulation {
                    ndc: Some("0001".into()),
                    ..Default::default()
                },
                Formulation::default(),
            ],
            ..Default::default()
        });

        let row = prepare_row(record).unwrap();
        assert_eq!(row.key(), "ALBUTEROL SULFATE");
        assert_eq!(row.domain(), Domain::Drugs);

        let Row::Drug(drug) = &row else {
            panic!("expected drug row");
        };
        assert_eq!(drug.formulations.len(), 1);
        assert_eq!(prepare_row(CanonicalRecord::Drug(drug.clone())).unwrap(), row);
    }
}
