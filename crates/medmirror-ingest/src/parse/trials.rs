// Clinical trial record parser
//
// Three vintages are recognised:
// - v2 API: camelCase modules under `protocolSection`
// - legacy full-study export: PascalCase modules under `Study.ProtocolSection`
// - flat snake_case export rows
//
// Every field lists its candidates in that order.

use super::extract::{Extractor, FieldPath};
use super::{completeness, RecordOutcome, RecordParser, SkipReason};
use crate::merge::identity::trial_key;
use crate::models::{CanonicalRecord, RawDraftRecord, Source, TrialRecord};
use serde_json::Value;

use FieldPath::{Each, Pointer, Split};

const NCT_ID: &[FieldPath] = &[
    Pointer("/protocolSection/identificationModule/nctId"),
    Pointer("/Study/ProtocolSection/IdentificationModule/NCTId"),
    Pointer("/nct_id"),
    Pointer("/NCTId"),
];

const BRIEF_TITLE: &[FieldPath] = &[
    Pointer("/protocolSection/identificationModule/briefTitle"),
    Pointer("/Study/ProtocolSection/IdentificationModule/BriefTitle"),
    Pointer("/brief_title"),
];

const OFFICIAL_TITLE: &[FieldPath] = &[
    Pointer("/protocolSection/identificationModule/officialTitle"),
    Pointer("/Study/ProtocolSection/IdentificationModule/OfficialTitle"),
    Pointer("/official_title"),
];

const BRIEF_SUMMARY: &[FieldPath] = &[
    Pointer("/protocolSection/descriptionModule/briefSummary"),
    Pointer("/Study/ProtocolSection/DescriptionModule/BriefSummary"),
    Pointer("/brief_summary"),
    Pointer("/brief_summary/textblock"),
];

const DETAILED_DESCRIPTION: &[FieldPath] = &[
    Pointer("/protocolSection/descriptionModule/detailedDescription"),
    Pointer("/Study/ProtocolSection/DescriptionModule/DetailedDescription"),
    Pointer("/detailed_description"),
    Pointer("/detailed_description/textblock"),
];

const OVERALL_STATUS: &[FieldPath] = &[
    Pointer("/protocolSection/statusModule/overallStatus"),
    Pointer("/Study/ProtocolSection/StatusModule/OverallStatus"),
    Pointer("/overall_status"),
];

const PHASES: &[FieldPath] = &[
    Pointer("/protocolSection/designModule/phases"),
    Pointer("/Study/ProtocolSection/DesignModule/PhaseList/Phase"),
    Split("/phase", "/"),
    Pointer("/phases"),
];

const STUDY_TYPE: &[FieldPath] = &[
    Pointer("/protocolSection/designModule/studyType"),
    Pointer("/Study/ProtocolSection/DesignModule/StudyType"),
    Pointer("/study_type"),
];

const START_DATE: &[FieldPath] = &[
    Pointer("/protocolSection/statusModule/startDateStruct/date"),
    Pointer("/Study/ProtocolSection/StatusModule/StartDateStruct/StartDate"),
    Pointer("/start_date"),
];

const COMPLETION_DATE: &[FieldPath] = &[
    Pointer("/protocolSection/statusModule/completionDateStruct/date"),
    Pointer("/protocolSection/statusModule/primaryCompletionDateStruct/date"),
    Pointer("/Study/ProtocolSection/StatusModule/CompletionDateStruct/CompletionDate"),
    Pointer("/completion_date"),
];

const ELIGIBILITY: &[FieldPath] = &[
    Pointer("/protocolSection/eligibilityModule/eligibilityCriteria"),
    Pointer("/Study/ProtocolSection/EligibilityModule/EligibilityCriteria"),
    Pointer("/eligibility_criteria"),
    Pointer("/eligibility/criteria/textblock"),
];

const CONDITIONS: &[FieldPath] = &[
    Pointer("/protocolSection/conditionsModule/conditions"),
    Pointer("/Study/ProtocolSection/ConditionsModule/ConditionList/Condition"),
    Pointer("/conditions"),
    Split("/condition", "|"),
];

const INTERVENTIONS: &[FieldPath] = &[
    Each("/protocolSection/armsInterventionsModule/interventions", "/name"),
    Each(
        "/Study/ProtocolSection/ArmsInterventionsModule/InterventionList/Intervention",
        "/InterventionName",
    ),
    Pointer("/interventions"),
    Each("/interventions", "/name"),
    Split("/intervention_names", "|"),
];

const LOCATIONS: &[FieldPath] = &[
    Each("/protocolSection/contactsLocationsModule/locations", "/city"),
    Each(
        "/Study/ProtocolSection/ContactsLocationsModule/LocationList/Location",
        "/LocationCity",
    ),
    Pointer("/locations"),
    Each("/locations", "/city"),
    Split("/location_cities", "|"),
];

const SPONSORS: &[FieldPath] = &[
    Pointer("/protocolSection/sponsorCollaboratorsModule/leadSponsor/name"),
    Each("/protocolSection/sponsorCollaboratorsModule/collaborators", "/name"),
    Pointer("/Study/ProtocolSection/SponsorCollaboratorsModule/LeadSponsor/LeadSponsorName"),
    Each(
        "/Study/ProtocolSection/SponsorCollaboratorsModule/CollaboratorList/Collaborator",
        "/CollaboratorName",
    ),
    Pointer("/lead_sponsor"),
    Pointer("/sponsors"),
    Split("/collaborators", "|"),
];

const KEYWORDS: &[FieldPath] = &[
    Pointer("/protocolSection/conditionsModule/keywords"),
    Pointer("/Study/ProtocolSection/ConditionsModule/KeywordList/Keyword"),
    Pointer("/keywords"),
    Split("/keyword", "|"),
];

const HAS_RESULTS: &[FieldPath] = &[Pointer("/hasResults"), Pointer("/has_results")];

const LEGACY_RESULTS_SECTION: &[FieldPath] = &[Pointer("/Study/ResultsSection")];

pub struct TrialParser;

impl RecordParser for TrialParser {
    fn source(&self) -> Source {
        Source::ClinicalTrials
    }

    fn parse_record(&self, record: &Value, index: usize) -> RecordOutcome {
        if !record.is_object() {
            return RecordOutcome::Skipped(SkipReason::NotAnObject);
        }

        let mut ext = Extractor::new(record);
        let Some(nct_id) = ext.text("nct_id", NCT_ID).and_then(|id| trial_key(&id)) else {
            return RecordOutcome::Skipped(SkipReason::MissingIdentity);
        };

        let phases = ext.list("phase", PHASES);
        let mut trial = TrialRecord {
            nct_id: nct_id.clone(),
            brief_title: ext.text("brief_title", BRIEF_TITLE),
            official_title: ext.text("official_title", OFFICIAL_TITLE),
            brief_summary: ext.text("brief_summary", BRIEF_SUMMARY),
            detailed_description: ext.text("detailed_description", DETAILED_DESCRIPTION),
            overall_status: ext.text("overall_status", OVERALL_STATUS),
            phase: (!phases.is_empty()).then(|| phases.join("/")),
            study_type: ext.text("study_type", STUDY_TYPE),
            start_date: ext.text("start_date", START_DATE),
            completion_date: ext.text("completion_date", COMPLETION_DATE),
            eligibility_criteria: ext.text("eligibility_criteria", ELIGIBILITY),
            conditions: ext.list("conditions", CONDITIONS),
            interventions: ext.list("interventions", INTERVENTIONS),
            locations: ext.list("locations", LOCATIONS),
            sponsors: ext.list("sponsors", SPONSORS),
            keywords: ext.list("keywords", KEYWORDS),
            has_results: ext.flag("has_results", HAS_RESULTS)
                || ext.present(LEGACY_RESULTS_SECTION),
            confidence_score: 0.0,
            data_sources: vec![Source::ClinicalTrials.as_str().to_string()],
        };

        trial.confidence_score = completeness(&[
            trial.brief_title.is_some() || trial.official_title.is_some(),
            trial.brief_summary.is_some(),
            trial.overall_status.is_some(),
            trial.phase.is_some(),
            !trial.conditions.is_empty(),
            !trial.interventions.is_empty(),
        ]);

        RecordOutcome::Parsed {
            draft: RawDraftRecord {
                source: Source::ClinicalTrials,
                identity_key: nct_id,
                fields: CanonicalRecord::Trial(trial),
                record_index: index,
            },
            dropped_fields: ext.into_dropped(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(record: Value) -> TrialRecord {
        match TrialParser.parse_record(&record, 0) {
            RecordOutcome::Parsed {
                draft: RawDraftRecord {
                    fields: CanonicalRecord::Trial(t),
                    ..
                },
                ..
            } => t,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_v2_vintage() {
        let trial = parse(json!({
            "protocolSection": {
                "identificationModule": {"nctId": "nct01234567", "briefTitle": "Albuterol Study"},
                "statusModule": {"overallStatus": "RECRUITING", "startDateStruct": {"date": "2023-01"}},
                "designModule": {"phases": ["PHASE2", "PHASE3"], "studyType": "INTERVENTIONAL"},
                "conditionsModule": {"conditions": ["Asthma", "asthma"], "keywords": ["bronchodilator"]},
                "armsInterventionsModule": {"interventions": [{"type": "DRUG", "name": "Albuterol"}]},
                "contactsLocationsModule": {"locations": [{"facility": "MGH", "city": "Boston"}]},
                "sponsorCollaboratorsModule": {"leadSponsor": {"name": "NIH"}}
            },
            "hasResults": false
        }));

        assert_eq!(trial.nct_id, "NCT01234567");
        assert_eq!(trial.phase.as_deref(), Some("PHASE2/PHASE3"));
        assert_eq!(trial.conditions, vec!["Asthma"]);
        assert_eq!(trial.interventions, vec!["Albuterol"]);
        assert_eq!(trial.locations, vec!["Boston"]);
        assert_eq!(trial.sponsors, vec!["NIH"]);
        assert_eq!(trial.start_date.as_deref(), Some("2023-01"));
        assert!(!trial.has_results);
        assert!(trial.confidence_score > 0.5);
    }

    #[test]
    fn test_legacy_vintage() {
        let trial = parse(json!({
            "Study": {
                "ProtocolSection": {
                    "IdentificationModule": {"NCTId": "NCT00000102", "OfficialTitle": "Legacy"},
                    "ConditionsModule": {"ConditionList": {"Condition": ["COPD"]}},
                    "ContactsLocationsModule": {"LocationList": {"Location": {"LocationCity": "Chicago"}}},
                    "DesignModule": {"PhaseList": {"Phase": ["Phase 1"]}}
                },
                "ResultsSection": {}
            }
        }));

        assert_eq!(trial.nct_id, "NCT00000102");
        assert_eq!(trial.official_title.as_deref(), Some("Legacy"));
        assert_eq!(trial.conditions, vec!["COPD"]);
        assert_eq!(trial.locations, vec!["Chicago"]);
        assert_eq!(trial.phase.as_deref(), Some("Phase 1"));
        assert!(trial.has_results);
    }

    #[test]
    fn test_flat_vintage() {
        let trial = parse(json!({
            "nct_id": "NCT09999999",
            "brief_title": "Flat export",
            "condition": "Asthma|Bronchitis",
            "location_cities": "Denver",
            "phase": "Phase 2/Phase 3",
            "has_results": "true"
        }));

        assert_eq!(trial.conditions, vec!["Asthma", "Bronchitis"]);
        assert_eq!(trial.locations, vec!["Denver"]);
        assert_eq!(trial.phase.as_deref(), Some("Phase 2/Phase 3"));
        assert!(trial.has_results);
    }

    #[test]
    fn test_missing_id_is_skipped() {
        let outcome = TrialParser.parse_record(&json!({"brief_title": "orphan"}), 4);
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::MissingIdentity));
    }

    #[test]
    fn test_malformed_field_keeps_rest() {
        let outcome = TrialParser.parse_record(
            &json!({"nct_id": "NCT1", "brief_title": {"oops": 1}, "overall_status": "COMPLETED"}),
            0,
        );
        match outcome {
            RecordOutcome::Parsed {
                draft,
                dropped_fields,
            } => {
                assert_eq!(dropped_fields, vec!["brief_title"]);
                let CanonicalRecord::Trial(t) = draft.fields else {
                    panic!("expected trial");
                };
                assert_eq!(t.overall_status.as_deref(), Some("COMPLETED"));
                assert!(t.brief_title.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
