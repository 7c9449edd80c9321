// Bulk flat-file downloader
//
// The drug sources publish whole-dataset snapshots rather than a paginated
// API. Each configured file is fetched once, unpacked in memory, decoded
// into JSON records and then sliced into batches. The continuation token is
// "<file_index>:<record_offset>", so a resumed run refetches at most the file
// it was in the middle of.

use super::archive;
use super::{BatchSource, FetchedBatch, RateLimitedClient};
use crate::config::BulkFile;
use crate::error::{IngestError, Result};
use crate::models::Source;
use crate::parse::delimited;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How a bulk source encodes its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkFormat {
    /// JSON document with a top-level `results` array
    JsonResults,
    /// Header row plus delimited rows
    Delimited(u8),
}

impl BulkFormat {
    pub fn for_source(source: Source) -> Option<Self> {
        match source {
            Source::DrugLabels => Some(BulkFormat::JsonResults),
            Source::NdcDirectory => Some(BulkFormat::Delimited(b'\t')),
            Source::OrangeBook => Some(BulkFormat::Delimited(b'~')),
            Source::ClinicalTrials => None,
        }
    }
}

/// Position inside the configured file list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkToken {
    pub file_index: usize,
    pub offset: usize,
}

impl BulkToken {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(Self::default());
        };
        let (file, offset) = raw
            .split_once(':')
            .ok_or_else(|| IngestError::state(format!("Malformed bulk token '{}'", raw)))?;
        let parse = |part: &str| {
            part.parse::<usize>()
                .map_err(|_| IngestError::state(format!("Malformed bulk token '{}'", raw)))
        };
        Ok(Self {
            file_index: parse(file)?,
            offset: parse(offset)?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.file_index, self.offset)
    }
}

pub struct BulkSource {
    source: Source,
    format: BulkFormat,
    client: RateLimitedClient,
    files: Vec<BulkFile>,
    /// Decoded records of the most recently fetched file
    current: Mutex<Option<(usize, Arc<Vec<Value>>)>>,
}

impl BulkSource {
    pub fn new(client: RateLimitedClient, files: Vec<BulkFile>) -> Result<Self> {
        let source = client.source();
        let format = BulkFormat::for_source(source).ok_or_else(|| {
            IngestError::config(format!("{} is not a bulk distribution", source))
        })?;
        Ok(Self {
            source,
            format,
            client,
            files,
            current: Mutex::new(None),
        })
    }

    /// Records of file `index`, fetched on first use
    async fn records_of(&self, index: usize) -> Result<(Arc<Vec<Value>>, bool)> {
        let mut current = self.current.lock().await;
        if let Some((cached, records)) = current.as_ref() {
            if *cached == index {
                return Ok((Arc::clone(records), false));
            }
        }

        let file = &self.files[index];
        info!(source = %self.source, url = %file.url, file_index = index, "Fetching bulk file");
        let bytes = self.client.get_bytes(&file.url).await?;

        let format = self.format;
        let url = file.url.clone();
        let member = file.member.clone();
        let records = tokio::task::spawn_blocking(move || decode_bulk(&bytes, &url, member.as_deref(), format))
            .await??;

        info!(
            source = %self.source,
            file_index = index,
            records = records.len(),
            "Bulk file decoded"
        );

        let records = Arc::new(records);
        *current = Some((index, Arc::clone(&records)));
        Ok((records, true))
    }
}

#[async_trait]
impl BatchSource for BulkSource {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_batch(
        &self,
        token: Option<&str>,
        max_records: usize,
        _page_size: usize,
        _since: Option<NaiveDate>,
    ) -> Result<FetchedBatch> {
        let mut position = BulkToken::parse(token)?;
        let mut batch = FetchedBatch::default();

        while position.file_index < self.files.len() && batch.records.len() < max_records {
            let (records, fetched) = self.records_of(position.file_index).await?;
            if fetched {
                batch.upstream_calls += 1;
            }

            let start = position.offset.min(records.len());
            let take = (max_records - batch.records.len()).min(records.len() - start);
            batch.records.extend(records[start..start + take].iter().cloned());
            position.offset = start + take;

            if position.offset >= records.len() {
                debug!(source = %self.source, file_index = position.file_index, "Bulk file exhausted");
                position = BulkToken {
                    file_index: position.file_index + 1,
                    offset: 0,
                };
            }
        }

        batch.next_token = (position.file_index < self.files.len()).then(|| position.encode());
        Ok(batch)
    }
}

/// Unpack and decode one bulk file into JSON records
pub fn decode_bulk(data: &[u8], name: &str, member: Option<&str>, format: BulkFormat) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    for member in archive::unpack(data, name, member)? {
        match format {
            BulkFormat::JsonResults => {
                let document: Value = serde_json::from_slice(&member.data)?;
                match document {
                    Value::Object(mut map) => match map.remove("results") {
                        Some(Value::Array(results)) => records.extend(results),
                        _ => {
                            return Err(IngestError::Upstream {
                                source_name: Source::DrugLabels,
                                message: format!("{} has no 'results' array", member.name),
                            })
                        }
                    },
                    Value::Array(results) => records.extend(results),
                    _ => {
                        return Err(IngestError::Upstream {
                            source_name: Source::DrugLabels,
                            message: format!("{} is not a JSON object or array", member.name),
                        })
                    }
                }
            }
            BulkFormat::Delimited(delimiter) => {
                records.extend(delimited::rows_to_objects(&member.data, delimiter)?);
            }
        }
    }
    Ok(records)
}
