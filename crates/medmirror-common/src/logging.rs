//! Logging bootstrap for MedMirror binaries
//!
//! Logs go to the console, to a daily rotated file, or both, as text or
//! JSON. Every setting can be overridden through `LOG_*` variables so the
//! same binary logs JSON to a file under a scheduler and text on a
//! terminal.
//!
//! Pipeline code logs with structured fields rather than formatted strings:
//!
//! ```rust,ignore
//! info!(source = %source, batch_number, records = batch.len(), "Batch written");
//! warn!(source = %source, attempt, delay_ms, "Upstream server error, retrying");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use medmirror_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Mirror started");
//!     Ok(())
//! }
//! ```

use crate::error::{MirrorError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Targets that are noisy at `info`: sqlx logs every statement
const DEFAULT_DIRECTIVES: &[&str] = &["sqlx=warn", "hyper=warn", "h2=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Match `raw` case-insensitively against a table of accepted spellings
fn choose<T: Copy>(kind: &str, raw: &str, table: &[(&str, T)]) -> Result<T> {
    let wanted = raw.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| MirrorError::Config(format!("Invalid log {}: {}", kind, raw)))
}

impl FromStr for LogLevel {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "level",
            s,
            &[
                ("trace", LogLevel::Trace),
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("warning", LogLevel::Warn),
                ("error", LogLevel::Error),
            ],
        )
    }
}

impl FromStr for LogOutput {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "output",
            s,
            &[
                ("console", LogOutput::Console),
                ("stdout", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
            ],
        )
    }
}

impl FromStr for LogFormat {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "format",
            s,
            &[("text", LogFormat::Text), ("pretty", LogFormat::Text), ("json", LogFormat::Json)],
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated files when `output` includes a file
    pub log_dir: PathBuf,
    /// "medmirror-ingest" rotates to "medmirror-ingest.2024-05-01"
    pub log_file_prefix: String,
    /// Per-target overrides such as `medmirror_ingest::download=debug`
    pub directives: Vec<String>,
    /// Emit span close events with busy/idle timings (one per source run)
    pub span_timings: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "medmirror".to_string(),
            directives: DEFAULT_DIRECTIVES.iter().map(|d| d.to_string()).collect(),
            span_timings: true,
        }
    }
}

fn env_value<T: FromStr<Err = MirrorError>>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.parse().map(Some),
        _ => Ok(None),
    }
}

impl LogConfig {
    /// Defaults overlaid with `LOG_*` variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and `LOG_SPAN_TIMINGS`
    ///
    /// `LOG_FILTER` directives are appended, so they win over the defaults.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_value("LOG_LEVEL")? {
            self.level = level;
        }
        if let Some(output) = env_value("LOG_OUTPUT")? {
            self.output = output;
        }
        if let Some(format) = env_value("LOG_FORMAT")? {
            self.format = format;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            self.directives.extend(split_directives(&filter));
        }
        if let Ok(raw) = std::env::var("LOG_SPAN_TIMINGS") {
            self.span_timings = raw
                .trim()
                .parse()
                .map_err(|_| MirrorError::Config(format!("LOG_SPAN_TIMINGS must be true or false, got {}", raw)))?;
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }
}

fn split_directives(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',').map(str::trim).filter(|d| !d.is_empty()).map(String::from)
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.config.directives.push(directive.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Build the filter: `RUST_LOG` if set, else the configured level, then the
/// configured directives
fn env_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .from_env_lossy();
    for directive in &config.directives {
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("Invalid log directive: {}", directive))?,
        );
    }
    Ok(filter)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let spans = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(spans)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process: dropping it
/// flushes and closes the file writer.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = env_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stderr, config.format == LogFormat::Text));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choices() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" json ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_output_targets() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::Console.file());
        assert!(!LogOutput::File.console());
    }

    #[test]
    fn test_builder_keeps_default_directives() {
        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::File)
            .log_file_prefix("medmirror-ingest")
            .directive("medmirror_ingest::download=trace")
            .build();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.log_file_prefix, "medmirror-ingest");
        assert!(config.directives.iter().any(|d| d == "sqlx=warn"));
        assert_eq!(
            config.directives.last().map(String::as_str),
            Some("medmirror_ingest::download=trace")
        );
        assert!(env_filter(&config).is_ok());
    }

    #[test]
    fn test_split_directives() {
        let parsed: Vec<String> = split_directives("sqlx=info, ,reqwest=debug").collect();
        assert_eq!(parsed, vec!["sqlx=info", "reqwest=debug"]);
    }
}
