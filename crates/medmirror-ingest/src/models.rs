//! Domain models for the mirror
//!
//! Two canonical schemas are mirrored independently: clinical trials keyed
//! by registry id and drugs keyed by normalized generic name. Parsers emit
//! [`RawDraftRecord`]s whose payload has the same shape as the canonical
//! record, so a draft merges into a stored record with the same policy used
//! to merge two drafts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Sources and domains
// ============================================================================

/// Upstream distribution a record was downloaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Token-paginated registry API
    ClinicalTrials,
    /// Structured product label corpus (bulk JSON)
    DrugLabels,
    /// Identifier-to-product directory (bulk delimited text)
    NdcDirectory,
    /// Reference therapeutic-equivalence table (bulk delimited text)
    OrangeBook,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::ClinicalTrials,
        Source::DrugLabels,
        Source::NdcDirectory,
        Source::OrangeBook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::ClinicalTrials => "clinical_trials",
            Source::DrugLabels => "drug_labels",
            Source::NdcDirectory => "ndc_directory",
            Source::OrangeBook => "orange_book",
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Source::ClinicalTrials => Domain::Trials,
            Source::DrugLabels | Source::NdcDirectory | Source::OrangeBook => Domain::Drugs,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "clinical_trials" | "trials" => Ok(Source::ClinicalTrials),
            "drug_labels" | "labels" => Ok(Source::DrugLabels),
            "ndc_directory" | "ndc" => Ok(Source::NdcDirectory),
            "orange_book" => Ok(Source::OrangeBook),
            other => Err(format!("Unknown source: {}", other)),
        }
    }
}

/// Canonical schema a source feeds into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Trials,
    Drugs,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Trials => "trials",
            Domain::Drugs => "drugs",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trials" | "trial" | "clinical_trials" => Ok(Domain::Trials),
            "drugs" | "drug" => Ok(Domain::Drugs),
            other => Err(format!("Unknown domain: {}", other)),
        }
    }
}

// ============================================================================
// Canonical records
// ============================================================================

/// Clinical trial keyed by registry id (maps to `clinical_trials`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrialRecord {
    pub nct_id: String,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub brief_summary: Option<String>,
    pub detailed_description: Option<String>,
    pub overall_status: Option<String>,
    pub phase: Option<String>,
    pub study_type: Option<String>,
    pub start_date: Option<String>,
    pub completion_date: Option<String>,
    pub eligibility_criteria: Option<String>,
    pub conditions: Vec<String>,
    pub interventions: Vec<String>,
    pub locations: Vec<String>,
    pub sponsors: Vec<String>,
    pub keywords: Vec<String>,
    pub has_results: bool,
    pub confidence_score: f64,
    pub data_sources: Vec<String>,
}

/// One marketed presentation of a drug
///
/// Entries with an NDC are identified by it; entries without one (reference
/// table rows) are identified by their full contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formulation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ndc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage_form: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub te_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketing_category: Option<String>,
}

impl Formulation {
    pub fn is_empty(&self) -> bool {
        *self == Formulation::default()
    }
}

/// Drug keyed by normalized generic name (maps to `drugs`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DrugRecord {
    pub generic_name: String,
    pub brand_names: Vec<String>,
    pub manufacturers: Vec<String>,
    pub active_ingredients: Vec<String>,
    pub routes: Vec<String>,
    pub therapeutic_class: Option<String>,
    pub mechanism_of_action: Option<String>,
    pub indications: Option<String>,
    pub contraindications: Option<String>,
    pub warnings: Option<String>,
    pub dosage_and_administration: Option<String>,
    #[sqlx(json)]
    pub formulations: Vec<Formulation>,
    /// Interaction notes keyed by the source that reported them
    #[sqlx(json)]
    pub interactions: BTreeMap<String, String>,
    pub has_label_text: bool,
    pub has_therapeutic_equivalent: bool,
    pub confidence_score: f64,
    pub data_sources: Vec<String>,
}

/// The durable, merged representation of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Trial(TrialRecord),
    Drug(DrugRecord),
}

impl CanonicalRecord {
    pub fn domain(&self) -> Domain {
        match self {
            CanonicalRecord::Trial(_) => Domain::Trials,
            CanonicalRecord::Drug(_) => Domain::Drugs,
        }
    }

    pub fn identity_key(&self) -> &str {
        match self {
            CanonicalRecord::Trial(t) => &t.nct_id,
            CanonicalRecord::Drug(d) => &d.generic_name,
        }
    }
}

// ============================================================================
// Drafts
// ============================================================================

/// One parsed upstream record, before consolidation
///
/// `fields` only carries what this single upstream record contained; empty
/// scalars and lists mean "not reported", never "cleared".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDraftRecord {
    pub source: Source,
    pub identity_key: String,
    pub fields: CanonicalRecord,
    /// Position of the record inside its batch file
    pub record_index: usize,
}

// ============================================================================
// Update log
// ============================================================================

/// Kind of ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Full,
    Incremental,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Full => "full",
            RunType::Incremental => "incremental",
        }
    }
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RunType::Full),
            "incremental" => Ok(RunType::Incremental),
            other => Err(format!("Unknown run type: {}", other)),
        }
    }
}

/// Lifecycle of an ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Success,
    /// Source was rate-limited or out of retry budget; nothing was failed
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "success" => Ok(RunStatus::Success),
            "skipped" => Ok(RunStatus::Skipped),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("Unknown run status: {}", other)),
        }
    }
}

/// One row of the `update_log` audit table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub id: i64,
    /// Shared by every source's row of one pipeline run
    pub run_id: Uuid,
    pub source: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub records_processed: i64,
    pub records_skipped: i64,
    pub records_failed: i64,
    pub files_processed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
