//! Parsers
//!
//! Turn the raw records of a batch file into [`RawDraftRecord`]s. Each
//! record yields a [`RecordOutcome`]: a record without a usable identity key
//! is skipped with a reason, a record with some malformed fields keeps the
//! fields that parsed. Only file-level failures (unreadable file, invalid
//! JSON) are errors.

pub mod delimited;
pub mod drugs;
pub mod extract;
pub mod trials;

pub use drugs::{LabelParser, NdcParser, OrangeBookParser};
pub use extract::{Extractor, FieldPath};
pub use trials::TrialParser;

use crate::download::BatchFile;
use crate::error::Result;
use crate::models::{RawDraftRecord, Source};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Why a record produced no draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No registry id, or neither a generic nor a brand name
    MissingIdentity,
    /// The record is not a JSON object
    NotAnObject,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingIdentity => "missing_identity",
            SkipReason::NotAnObject => "not_an_object",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of parsing one upstream record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Parsed {
        draft: RawDraftRecord,
        /// Fields dropped because every candidate was malformed
        dropped_fields: Vec<&'static str>,
    },
    Skipped(SkipReason),
}

/// Per-source record parser
pub trait RecordParser: Send + Sync {
    fn source(&self) -> Source;

    fn parse_record(&self, record: &Value, index: usize) -> RecordOutcome;
}

pub fn parser_for(source: Source) -> Box<dyn RecordParser> {
    match source {
        Source::ClinicalTrials => Box::new(TrialParser),
        Source::DrugLabels => Box::new(LabelParser),
        Source::NdcDirectory => Box::new(NdcParser),
        Source::OrangeBook => Box::new(OrangeBookParser),
    }
}

/// Drafts and counts from one batch file
#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    pub drafts: Vec<RawDraftRecord>,
    pub parsed: usize,
    pub skipped: usize,
    pub skip_reasons: BTreeMap<SkipReason, usize>,
    /// Individual fields dropped across all parsed records
    pub dropped_fields: usize,
}

impl ParseReport {
    pub fn absorb(&mut self, other: ParseReport) {
        self.drafts.extend(other.drafts);
        self.parsed += other.parsed;
        self.skipped += other.skipped;
        self.dropped_fields += other.dropped_fields;
        for (reason, count) in other.skip_reasons {
            *self.skip_reasons.entry(reason).or_insert(0) += count;
        }
    }
}

/// Parse every record of a batch
pub fn parse_batch(batch: &BatchFile) -> ParseReport {
    parse_records(batch.source, &batch.records)
}

pub fn parse_records(source: Source, records: &[Value]) -> ParseReport {
    let parser = parser_for(source);
    let mut report = ParseReport::default();

    for (index, record) in records.iter().enumerate() {
        match parser.parse_record(record, index) {
            RecordOutcome::Parsed {
                draft,
                dropped_fields,
            } => {
                if !dropped_fields.is_empty() {
                    debug!(
                        source = %source,
                        record_index = index,
                        identity_key = %draft.identity_key,
                        fields = ?dropped_fields,
                        "Dropped malformed fields"
                    );
                }
                report.dropped_fields += dropped_fields.len();
                report.parsed += 1;
                report.drafts.push(draft);
            }
            RecordOutcome::Skipped(reason) => {
                debug!(source = %source, record_index = index, reason = %reason, "Skipped record");
                report.skipped += 1;
                *report.skip_reasons.entry(reason).or_insert(0) += 1;
            }
        }
    }

    report
}

/// Read a batch file and parse it
///
/// File-level I/O and decode errors propagate; record-level problems are
/// counted in the report.
pub fn parse_file(path: &Path) -> Result<ParseReport> {
    let batch = BatchFile::read(path)?;
    let report = parse_batch(&batch);
    info!(
        source = %batch.source,
        batch_number = batch.batch_number,
        parsed = report.parsed,
        skipped = report.skipped,
        dropped_fields = report.dropped_fields,
        "Batch parsed"
    );
    Ok(report)
}

/// Share of `checks` that hold, scaled into [0.5, 1.0]
///
/// A record that passed identity checks is worth at least 0.5; each
/// populated descriptive field adds to that.
pub(crate) fn completeness(checks: &[bool]) -> f64 {
    if checks.is_empty() {
        return 0.5;
    }
    let filled = checks.iter().filter(|c| **c).count() as f64;
    let score = 0.5 + 0.5 * filled / checks.len() as f64;
    (score * 100.0).round() / 100.0
}
