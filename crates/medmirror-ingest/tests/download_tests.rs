//! Downloader behaviour against a mocked registry API

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{client, fast_retry, open_tracker, studies_page, study};
use medmirror_ingest::download::{BatchFile, Downloader, TrialsSource};
use medmirror_ingest::models::{RunType, Source};
use medmirror_ingest::IngestError;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STUDIES: &str = "/api/v2/studies";

fn downloader(server: &MockServer, dir: &TempDir, tracker: Arc<medmirror_ingest::state::StateTracker>) -> Downloader {
    let source = TrialsSource::new(
        client(Source::ClinicalTrials, Arc::clone(&tracker), fast_retry()),
        format!("{}/api/v2", server.uri()),
    );
    Downloader::new(Arc::new(source), tracker, dir.path().join("batches"), 2, 2)
}

#[tokio::test]
async fn test_429_blocks_source_for_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(dir.path()).await;
    let http = client(Source::ClinicalTrials, Arc::clone(&tracker), fast_retry());
    let url = format!("{}{}", server.uri(), STUDIES);

    let received = Utc::now();
    let err = http.get_json(&url, &[]).await.unwrap_err();
    let IngestError::RateLimited { until, .. } = err else {
        panic!("expected RateLimited, got {:?}", err);
    };
    assert!(until >= received + ChronoDuration::seconds(120));

    // Refused locally; the mock's expect(1) fails the test on a second hit
    let again = http.get_json(&url, &[]).await.unwrap_err();
    assert!(matches!(again, IngestError::RateLimited { .. }));
    assert!(again.is_source_skip());

    // The block survives a restart
    drop(http);
    drop(tracker);
    let reopened = open_tracker(dir.path()).await;
    assert!(reopened.is_rate_limited(Source::ClinicalTrials).await);
    assert!(
        reopened
            .is_rate_limited_at(Source::ClinicalTrials, received + ChronoDuration::seconds(119))
            .await
    );
    assert!(
        !reopened
            .is_rate_limited_at(Source::ClinicalTrials, received + ChronoDuration::seconds(125))
            .await
    );
    assert_eq!(reopened.get_daily_retry_count(Source::ClinicalTrials).await, 1);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .respond_with(ResponseTemplate::new(200).set_body_json(studies_page(vec![], None)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(dir.path()).await;
    let http = client(Source::ClinicalTrials, Arc::clone(&tracker), fast_retry());

    let body = http.get_json(&format!("{}{}", server.uri(), STUDIES), &[]).await.unwrap();
    assert_eq!(body["studies"], json!([]));
    assert_eq!(http.requests_sent(), 2);
    assert_eq!(tracker.get_daily_retry_count(Source::ClinicalTrials).await, 1);
}

#[tokio::test]
async fn test_server_error_attempts_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(dir.path()).await;
    let http = client(Source::ClinicalTrials, Arc::clone(&tracker), fast_retry());

    let err = http.get_json(&format!("{}{}", server.uri(), STUDIES), &[]).await.unwrap_err();
    assert!(matches!(err, IngestError::TransientNetwork { .. }));
    assert!(!err.is_source_skip());
    assert_eq!(tracker.get_daily_retry_count(Source::ClinicalTrials).await, 3);
}

#[tokio::test]
async fn test_exhausted_daily_budget_skips_source() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(dir.path()).await;
    let retry = medmirror_ingest::config::RetryConfig {
        daily_retry_budget: 2,
        ..fast_retry()
    };
    tracker.increment_retry_count(Source::ClinicalTrials).await.unwrap();
    tracker.increment_retry_count(Source::ClinicalTrials).await.unwrap();

    let http = client(Source::ClinicalTrials, Arc::clone(&tracker), retry);
    let err = http.get_json(&format!("{}{}", server.uri(), STUDIES), &[]).await.unwrap_err();
    assert!(matches!(err, IngestError::RetryBudgetExhausted { count: 2, .. }));
    assert!(err.is_source_skip());
}

async fn mount_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .respond_with(ResponseTemplate::new(200).set_body_json(studies_page(
            vec![study("NCT00000001", "One", &["Boston"]), study("NCT00000002", "Two", &[])],
            Some("t2"),
        )))
        .with_priority(5)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .and(query_param("pageToken", "t2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(studies_page(
            vec![study("NCT00000003", "Three", &[]), study("NCT00000004", "Four", &[])],
            Some("t3"),
        )))
        .with_priority(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_download_all_follows_continuation_tokens() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .and(query_param("pageToken", "t3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(studies_page(
            vec![study("NCT00000005", "Five", &[])],
            None,
        )))
        .with_priority(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(dir.path()).await;
    tracker.begin_run(Source::ClinicalTrials, RunType::Full, None).await.unwrap();

    let outcome = downloader(&server, &dir, Arc::clone(&tracker))
        .download_all(None)
        .await
        .unwrap();

    assert_eq!(outcome.batches.len(), 3);
    assert_eq!(outcome.records, 5);
    assert!(!outcome.hit_limit);

    let batch = BatchFile::read(&outcome.batches[1].path).unwrap();
    assert_eq!(batch.batch_number, 2);
    assert_eq!(batch.record_count, 2);
    assert_eq!(batch.upstream_calls, 1);
    assert_eq!(batch.start_token.as_deref(), Some("t2"));
    assert_eq!(batch.next_token.as_deref(), Some("t3"));

    let cursor = tracker.cursor(Source::ClinicalTrials).await.unwrap();
    assert!(cursor.download_complete);
    assert_eq!(cursor.last_batch_number, 3);
    assert_eq!(tracker.pending_batches(Source::ClinicalTrials).await.len(), 3);
}

#[tokio::test]
async fn test_download_limit_caps_records() {
    let server = MockServer::start().await;
    mount_pages(&server).await;

    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(dir.path()).await;
    tracker.begin_run(Source::ClinicalTrials, RunType::Full, None).await.unwrap();

    let outcome = downloader(&server, &dir, Arc::clone(&tracker))
        .download_all(Some(4))
        .await
        .unwrap();

    // The third page is never requested: an unmatched request would 404
    assert_eq!(outcome.batches.len(), 2);
    assert_eq!(outcome.records, 4);
    assert!(outcome.hit_limit);
    assert!(tracker.cursor(Source::ClinicalTrials).await.unwrap().download_complete);
}

#[tokio::test]
async fn test_resume_after_crash_continues_at_next_batch() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    // Third page keeps failing: the run dies after batch 2
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .and(query_param("pageToken", "t3"))
        .respond_with(ResponseTemplate::new(502))
        .with_priority(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    {
        let tracker = open_tracker(dir.path()).await;
        tracker.begin_run(Source::ClinicalTrials, RunType::Full, None).await.unwrap();
        let err = downloader(&server, &dir, Arc::clone(&tracker))
            .download_all(None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::TransientNetwork { .. }));
        // Batch 1 was parsed and stored before the crash
        tracker.mark_processed(Source::ClinicalTrials, 1).await.unwrap();
    }

    server.reset().await;
    mount_pages(&server).await;
    Mock::given(method("GET"))
        .and(path(STUDIES))
        .and(query_param("pageToken", "t3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(studies_page(
            vec![study("NCT00000005", "Five", &[])],
            None,
        )))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    let tracker = open_tracker(dir.path()).await;
    let cursor = tracker
        .begin_run(Source::ClinicalTrials, RunType::Full, None)
        .await
        .unwrap();
    assert_eq!(cursor.last_batch_number, 2);
    assert_eq!(cursor.next_token.as_deref(), Some("t3"));

    let outcome = downloader(&server, &dir, Arc::clone(&tracker))
        .download_all(None)
        .await
        .unwrap();
    assert_eq!(outcome.batches.len(), 1);
    assert_eq!(outcome.batches[0].batch_number, 3);

    let pending: Vec<u64> = tracker
        .pending_batches(Source::ClinicalTrials)
        .await
        .iter()
        .map(|e| e.batch_number)
        .collect();
    assert_eq!(pending, vec![2, 3]);

    let mut ids = Vec::new();
    for entry in tracker.snapshot().await.manifest {
        let batch = BatchFile::read(&entry.path).unwrap();
        for record in batch.records {
            ids.push(record["protocolSection"]["identificationModule"]["nctId"].as_str().unwrap().to_string());
        }
    }
    // Nothing from the stored batches was fetched a second time
    assert_eq!(ids.len(), 5);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}
