// Clinical trial registry downloader
//
// ClinicalTrials.gov v2: GET {base}/studies?format=json&pageSize=N[&pageToken=T]
// returns { "studies": [...], "nextPageToken": "..." }. The token is opaque
// and absent on the last page.

use super::{BatchSource, FetchedBatch, RateLimitedClient};
use crate::error::{IngestError, Result};
use crate::models::Source;
use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

pub struct TrialsSource {
    client: RateLimitedClient,
    base_url: String,
}

impl TrialsSource {
    pub fn new(client: RateLimitedClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn studies_url(&self) -> String {
        format!("{}/studies", self.base_url)
    }

    fn page_query(token: Option<&str>, page_size: usize, since: Option<NaiveDate>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("format", "json".to_string()),
            ("pageSize", page_size.to_string()),
        ];
        if let Some(since) = since {
            query.push((
                "query.term",
                format!("AREA[LastUpdatePostDate]RANGE[{},MAX]", since.format("%Y-%m-%d")),
            ));
        }
        if let Some(token) = token {
            query.push(("pageToken", token.to_string()));
        }
        query
    }
}

#[async_trait]
impl BatchSource for TrialsSource {
    fn source(&self) -> Source {
        Source::ClinicalTrials
    }

    async fn fetch_batch(
        &self,
        token: Option<&str>,
        max_records: usize,
        page_size: usize,
        since: Option<NaiveDate>,
    ) -> Result<FetchedBatch> {
        let url = self.studies_url();
        let mut batch = FetchedBatch::default();
        let mut token = token.map(str::to_string);

        loop {
            let remaining = max_records.saturating_sub(batch.records.len());
            let size = page_size.min(remaining).max(1);
            let query = Self::page_query(token.as_deref(), size, since);

            let body = self.client.get_json(&url, &query).await?;
            batch.upstream_calls += 1;

            let studies = body
                .get("studies")
                .and_then(|s| s.as_array())
                .ok_or_else(|| IngestError::Upstream {
                    source_name: Source::ClinicalTrials,
                    message: "Response has no 'studies' array".to_string(),
                })?;
            batch.records.extend(studies.iter().cloned());

            token = body
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string);

            debug!(
                source = %Source::ClinicalTrials,
                page_records = studies.len(),
                records = batch.records.len(),
                has_next = token.is_some(),
                "Fetched page"
            );

            if token.is_none() || batch.records.len() >= max_records {
                break;
            }
        }

        batch.next_token = token;
        Ok(batch)
    }
}
