//! MedMirror ingestion library
//!
//! Mirrors public clinical-trial and drug datasets into PostgreSQL.
//!
//! # Sources
//!
//! - **clinical_trials**: token-paginated registry API
//! - **drug_labels**: structured product label corpus (bulk JSON)
//! - **ndc_directory**: product directory (bulk tab-delimited)
//! - **orange_book**: therapeutic-equivalence table (bulk `~`-delimited)
//!
//! # Example
//!
//! ```no_run
//! use medmirror_ingest::{IngestConfig, MirrorService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = MirrorService::from_config(IngestConfig::from_env()?).await?;
//!     let summary = service.trigger_update(true, Some(1000)).await?;
//!     println!("{:?}: {} records", summary.status, summary.records_processed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod merge;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod service;
pub mod state;
pub mod storage;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use models::{CanonicalRecord, Domain, DrugRecord, RawDraftRecord, Source, TrialRecord};
pub use pipeline::{Pipeline, PipelineReport, RunOptions};
pub use service::{MirrorService, MirrorStatus, UpdateStatus, UpdateSummary};
pub use storage::SearchFilter;
