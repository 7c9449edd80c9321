//! MedMirror Common Library
//!
//! Shared error handling, logging bootstrap and checksum helpers for the
//! MedMirror workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`MirrorError`] and the [`Result`] alias
//! - **Checksums**: SHA-256 digests used to verify downloaded batch files
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use medmirror_common::checksum::sha256_file;
//! use medmirror_common::Result;
//!
//! fn describe(path: &str) -> Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, path, "Batch file digest");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{MirrorError, Result};
