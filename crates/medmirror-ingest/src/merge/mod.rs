//! Merge/dedup engine
//!
//! Drafts are grouped by identity key and folded in encounter order. The
//! fold uses the same [`Mergeable`] implementation whether the left side is
//! another draft or a record already in the store, so combining a new draft
//! with an old canonical record follows exactly the rules for two drafts.
//!
//! List, flag and score fields merge associatively and commutatively.
//! Longer-text-wins is idempotent but not commutative when two candidates
//! have the same length and differ; the existing value wins then.

pub mod identity;
pub mod policy;

use crate::models::{CanonicalRecord, Domain, DrugRecord, RawDraftRecord, TrialRecord};
use policy::{max_score, merge_formulations, merge_map, prefer_longer, union_ci};
use std::collections::BTreeMap;
use tracing::warn;

/// Field-by-field combination of two versions of the same entity
pub trait Mergeable {
    /// `self` is the existing side, `incoming` the newer observation
    fn merged(&self, incoming: &Self) -> Self;
}

impl Mergeable for TrialRecord {
    fn merged(&self, incoming: &Self) -> Self {
        Self {
            nct_id: self.nct_id.clone(),
            brief_title: prefer_longer(self.brief_title.as_ref(), incoming.brief_title.as_ref()),
            official_title: prefer_longer(self.official_title.as_ref(), incoming.official_title.as_ref()),
            brief_summary: prefer_longer(self.brief_summary.as_ref(), incoming.brief_summary.as_ref()),
            detailed_description: prefer_longer(
                self.detailed_description.as_ref(),
                incoming.detailed_description.as_ref(),
            ),
            overall_status: prefer_longer(self.overall_status.as_ref(), incoming.overall_status.as_ref()),
            phase: prefer_longer(self.phase.as_ref(), incoming.phase.as_ref()),
            study_type: prefer_longer(self.study_type.as_ref(), incoming.study_type.as_ref()),
            start_date: prefer_longer(self.start_date.as_ref(), incoming.start_date.as_ref()),
            completion_date: prefer_longer(self.completion_date.as_ref(), incoming.completion_date.as_ref()),
            eligibility_criteria: prefer_longer(
                self.eligibility_criteria.as_ref(),
                incoming.eligibility_criteria.as_ref(),
            ),
            conditions: union_ci(&self.conditions, &incoming.conditions),
            interventions: union_ci(&self.interventions, &incoming.interventions),
            locations: union_ci(&self.locations, &incoming.locations),
            sponsors: union_ci(&self.sponsors, &incoming.sponsors),
            keywords: union_ci(&self.keywords, &incoming.keywords),
            has_results: self.has_results || incoming.has_results,
            confidence_score: max_score(self.confidence_score, incoming.confidence_score),
            data_sources: union_ci(&self.data_sources, &incoming.data_sources),
        }
    }
}

impl Mergeable for DrugRecord {
    fn merged(&self, incoming: &Self) -> Self {
        Self {
            generic_name: self.generic_name.clone(),
            brand_names: union_ci(&self.brand_names, &incoming.brand_names),
            manufacturers: union_ci(&self.manufacturers, &incoming.manufacturers),
            active_ingredients: union_ci(&self.active_ingredients, &incoming.active_ingredients),
            routes: union_ci(&self.routes, &incoming.routes),
            therapeutic_class: prefer_longer(self.therapeutic_class.as_ref(), incoming.therapeutic_class.as_ref()),
            mechanism_of_action: prefer_longer(
                self.mechanism_of_action.as_ref(),
                incoming.mechanism_of_action.as_ref(),
            ),
            indications: prefer_longer(self.indications.as_ref(), incoming.indications.as_ref()),
            contraindications: prefer_longer(self.contraindications.as_ref(), incoming.contraindications.as_ref()),
            warnings: prefer_longer(self.warnings.as_ref(), incoming.warnings.as_ref()),
            dosage_and_administration: prefer_longer(
                self.dosage_and_administration.as_ref(),
                incoming.dosage_and_administration.as_ref(),
            ),
            formulations: merge_formulations(&self.formulations, &incoming.formulations),
            interactions: merge_map(&self.interactions, &incoming.interactions),
            has_label_text: self.has_label_text || incoming.has_label_text,
            has_therapeutic_equivalent: self.has_therapeutic_equivalent
                || incoming.has_therapeutic_equivalent,
            confidence_score: max_score(self.confidence_score, incoming.confidence_score),
            data_sources: union_ci(&self.data_sources, &incoming.data_sources),
        }
    }
}

/// Merge `incoming` into `existing`
///
/// Returns `None` when the two belong to different domains.
pub fn merge_into(existing: &CanonicalRecord, incoming: &CanonicalRecord) -> Option<CanonicalRecord> {
    match (existing, incoming) {
        (CanonicalRecord::Trial(a), CanonicalRecord::Trial(b)) => Some(CanonicalRecord::Trial(a.merged(b))),
        (CanonicalRecord::Drug(a), CanonicalRecord::Drug(b)) => Some(CanonicalRecord::Drug(a.merged(b))),
        _ => None,
    }
}

/// Identity a draft groups under
pub type GroupKey = (Domain, String);

/// Bucket drafts by identity key, preserving encounter order inside a bucket
///
/// Keys iterate in sorted order.
pub fn group_by_identity(drafts: Vec<RawDraftRecord>) -> BTreeMap<GroupKey, Vec<RawDraftRecord>> {
    let mut groups: BTreeMap<GroupKey, Vec<RawDraftRecord>> = BTreeMap::new();
    for draft in drafts {
        groups
            .entry((draft.fields.domain(), draft.identity_key.clone()))
            .or_default()
            .push(draft);
    }
    groups
}

/// Fold a group of drafts for one identity into a canonical record
pub fn merge_group(drafts: &[RawDraftRecord]) -> Option<CanonicalRecord> {
    let (first, rest) = drafts.split_first()?;
    let mut merged = first.fields.clone();
    for draft in rest {
        match merge_into(&merged, &draft.fields) {
            Some(next) => merged = next,
            None => warn!(
                identity_key = %draft.identity_key,
                source = %draft.source,
                "Draft domain does not match its group, ignored"
            ),
        }
    }
    Some(merged)
}

/// Group and merge in one step, in identity-key order
pub fn consolidate(drafts: Vec<RawDraftRecord>) -> Vec<CanonicalRecord> {
    group_by_identity(drafts)
        .values()
        .filter_map(|group| merge_group(group))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{Formulation, Source};

    fn trial_draft(id: &str, locations: &[&str]) -> RawDraftRecord {
        RawDraftRecord {
            source: Source::ClinicalTrials,
            identity_key: id.to_string(),
            fields: CanonicalRecord::Trial(TrialRecord {
                nct_id: id.to_string(),
                locations: locations.iter().map(|s| s.to_string()).collect(),
                data_sources: vec!["clinical_trials".to_string()],
                ..Default::default()
            }),
            record_index: 0,
        }
    }

    #[test]
    fn test_trial_location_union() {
        let drafts = vec![
            trial_draft("NCT00000001", &["Boston"]),
            trial_draft("NCT00000001", &["boston", "Chicago"]),
        ];
        let merged = consolidate(drafts);
        assert_eq!(merged.len(), 1);
        let CanonicalRecord::Trial(trial) = &merged[0] else {
            panic!("expected trial");
        };
        assert_eq!(trial.locations, vec!["Boston", "Chicago"]);
        assert_eq!(trial.data_sources, vec!["clinical_trials"]);
    }

    #[test]
    fn test_drug_draft_merges_into_existing_record() {
        let existing = DrugRecord {
            generic_name: "ALBUTEROL".into(),
            brand_names: vec!["Ventolin HFA".into()],
            indications: Some("Bronchospasm".into()),
            confidence_score: 0.9,
            ..Default::default()
        };
        let incoming = DrugRecord {
            generic_name: "ALBUTEROL".into(),
            formulations: vec![Formulation {
                ndc: Some("00000-0001".into()),
                ..Default::default()
            }],
            indications: Some("".into()),
            confidence_score: 0.5,
            ..Default::default()
        };

        let merged = existing.merged(&incoming);
        assert_eq!(merged.generic_name, "ALBUTEROL");
        assert_eq!(merged.indications.as_deref(), Some("Bronchospasm"));
        assert_eq!(merged.confidence_score, 0.9);
        assert_eq!(merged.formulations[0].ndc.as_deref(), Some("00000-0001"));
        assert_eq!(merged.merged(&incoming), merged);
    }

    #[test]
    fn test_group_keeps_encounter_order() {
        let drafts = vec![
            trial_draft("NCT2", &["a"]),
            trial_draft("NCT1", &["b"]),
            trial_draft("NCT2", &["c"]),
        ];
        let groups = group_by_identity(drafts);
        let keys: Vec<_> = groups.keys().map(|(_, k)| k.as_str()).collect();
        assert_eq!(keys, vec!["NCT1", "NCT2"]);

        let CanonicalRecord::Trial(t) = merge_group(&groups[&(Domain::Trials, "NCT2".to_string())]).unwrap() else {
            panic!("expected trial");
        };
        assert_eq!(t.locations, vec!["a", "c"]);
    }

    #[test]
    fn test_merge_into_rejects_cross_domain() {
        let trial = CanonicalRecord::Trial(TrialRecord::default());
        let drug = CanonicalRecord::Drug(DrugRecord::default());
        assert!(merge_into(&trial, &drug).is_none());
    }
}
