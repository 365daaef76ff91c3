//! End-to-end scenarios exercising the recorder, storage, retention, and
//! export surfaces together through the public API (spec §8 "Concrete
//! end-to-end scenarios").

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use evidence_pipeline::export::{export_csv_stream, CsvExportOptions};
use evidence_pipeline::record::{PolicyDecision, QueryFilter, Status};
use evidence_pipeline::recorder::{Recorder, RecorderConfig, RequestInput, ResponseInput};
use evidence_pipeline::retention::{Pruner, RetentionConfig};
use evidence_pipeline::storage::{MemoryBackend, Storage};

fn request(request_id: &str) -> RequestInput {
    RequestInput {
        request_id: request_id.to_string(),
        model: Some("gpt-4".to_string()),
        policy_decision: Some(PolicyDecision::Allow),
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_correlation_produces_one_record_with_merged_usage() {
    let storage = Arc::new(MemoryBackend::new());
    let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

    recorder.record_request(request("r1"));
    recorder
        .record_response(ResponseInput {
            request_id: "r1".to_string(),
            response_status: Some(200),
            prompt_tokens: Some(50),
            completion_tokens: Some(20),
            actual_cost: Some(Decimal::new(7, 3)),
            ..Default::default()
        })
        .await
        .unwrap();
    recorder.close().await;

    let cancel = CancellationToken::new();
    let records = storage.query(&QueryFilter::new(), &cancel).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request_id, "r1");
    assert_eq!(records[0].total_tokens, Some(70));
    assert_eq!(records[0].actual_cost, Some(Decimal::new(7, 3)));
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_drain_on_shutdown_preserves_every_enqueued_record() {
    let storage = Arc::new(MemoryBackend::new());
    let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

    for i in 0..10 {
        let id = format!("r{i}");
        recorder.record_request(request(&id));
        recorder
            .record_response(ResponseInput {
                request_id: id,
                response_status: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    recorder.close().await;

    let cancel = CancellationToken::new();
    let records = storage.query(&QueryFilter::new(), &cancel).await.unwrap();
    assert_eq!(records.len(), 10);
    let mut ids: Vec<_> = records.iter().map(|r| r.request_id.clone()).collect();
    ids.sort();
    let expected: Vec<_> = (0..10).map(|i| format!("r{i}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn scenario_streaming_export_row_count_independent_of_consumer_speed() {
    let storage = Arc::new(MemoryBackend::new());
    let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

    for i in 0..200 {
        let id = format!("r{i}");
        recorder.record_request(request(&id));
        recorder
            .record_response(ResponseInput {
                request_id: id,
                response_status: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    recorder.close().await;

    let mut filter = QueryFilter::new();
    filter.limit = Some(200);
    let cancel = CancellationToken::new();
    let stream = storage.query_stream(filter, cancel.clone());

    let mut buf = Vec::new();
    let count = export_csv_stream(stream, CsvExportOptions::default(), &cancel, &mut buf)
        .await
        .unwrap();
    assert_eq!(count, 200);

    let text = String::from_utf8(buf).unwrap();
    assert_eq!(text.lines().count(), 201);
}

#[tokio::test]
async fn scenario_age_based_prune_with_archive() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryBackend::new());
    let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

    let now = Utc::now();
    for (label, age_days) in [("old", 100), ("mid", 95), ("recent", 1)] {
        let mut req = request(label);
        req.request_time = Some(now - ChronoDuration::days(age_days));
        recorder.record_request(req);
        recorder
            .record_response(ResponseInput {
                request_id: label.to_string(),
                response_status: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    recorder.close().await;

    let dir = tempfile::tempdir().unwrap();
    let config = RetentionConfig {
        retention_days: 90,
        max_records: 0,
        prune_schedule: String::new(),
        archive_before_delete: true,
        archive_path: dir.path().to_path_buf(),
    };
    let pruner = Pruner::new(config, storage.clone());
    let deleted = pruner.prune().await.unwrap();
    assert_eq!(deleted, 2);

    let cancel = CancellationToken::new();
    let remaining = storage.query(&QueryFilter::new(), &cancel).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].request_id, "recent");

    let mut entries = std::fs::read_dir(dir.path()).unwrap();
    let entry = entries.next().unwrap().unwrap();
    assert!(entries.next().is_none());
    let contents = std::fs::read_to_string(entry.path()).unwrap();
    let archived: Vec<serde_json::Value> = serde_json::from_str(&contents).unwrap();
    assert_eq!(archived.len(), 2);
}

#[tokio::test]
async fn scenario_count_based_prune_keeps_newest_oldest_first() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryBackend::new());
    let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

    let base = Utc::now() - ChronoDuration::days(200);
    for i in 0..150 {
        let id = format!("r{i}");
        let mut req = request(&id);
        req.request_time = Some(base + ChronoDuration::minutes(i));
        recorder.record_request(req);
        recorder
            .record_response(ResponseInput {
                request_id: id,
                response_status: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    recorder.close().await;

    let config = RetentionConfig {
        retention_days: 0,
        max_records: 80,
        prune_schedule: String::new(),
        archive_before_delete: false,
        archive_path: PathBuf::from("./unused"),
    };
    let pruner = Pruner::new(config, storage.clone());
    pruner.prune().await.unwrap();

    let cancel = CancellationToken::new();
    let mut filter = QueryFilter::new();
    filter.limit = Some(200);
    let remaining = storage.query(&filter, &cancel).await.unwrap();
    assert_eq!(remaining.len(), 80);
    let min_request_time = remaining.iter().map(|r| r.request_time).min().unwrap();
    // The 71st inserted record (index 70) is the oldest survivor.
    assert_eq!(min_request_time, base + ChronoDuration::minutes(70));
}

#[tokio::test]
async fn scenario_status_filter_overlap() {
    let storage = Arc::new(MemoryBackend::new());
    let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

    recorder.record_request(request("a"));
    recorder
        .record_response(ResponseInput {
            request_id: "a".to_string(),
            response_status: Some(200),
            ..Default::default()
        })
        .await
        .unwrap();

    recorder.record_request(request("b"));
    recorder
        .record_response(ResponseInput {
            request_id: "b".to_string(),
            error: Some("timeout".to_string()),
            error_type: Some("upstream_timeout".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut blocked_request = request("c");
    blocked_request.policy_decision = Some(PolicyDecision::Block);
    blocked_request.block_reason = Some("policy violation".to_string());
    recorder.record_request(blocked_request);
    recorder
        .record_response(ResponseInput {
            request_id: "c".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    recorder.close().await;

    let cancel = CancellationToken::new();
    let mut success_filter = QueryFilter::new();
    success_filter.status = Some(Status::Success);
    let success = storage.query(&success_filter, &cancel).await.unwrap();
    let mut success_ids: Vec<_> = success.iter().map(|r| r.request_id.clone()).collect();
    success_ids.sort();
    assert_eq!(success_ids, vec!["a", "c"]);

    let mut error_filter = QueryFilter::new();
    error_filter.status = Some(Status::Error);
    let errors = storage.query(&error_filter, &cancel).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].request_id, "b");

    let mut blocked_filter = QueryFilter::new();
    blocked_filter.status = Some(Status::Blocked);
    let blocked = storage.query(&blocked_filter, &cancel).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].request_id, "c");
}
