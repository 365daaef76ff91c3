//! Two-phase correlation recorder (spec §4.4).
//!
//! The proxy calls [`Recorder::record_request`] at policy-evaluation time and
//! [`Recorder::record_response`] once the upstream call returns. Neither call
//! blocks the proxy's request path: `record_request` only touches the
//! in-flight map, and `record_response` enqueues onto a bounded channel that
//! a single background worker drains into storage. The shutdown/drain
//! discipline mirrors the `tokio::select! { biased; ... }` shape an
//! LLM-proxy analytics batcher in this lineage uses for exactly this
//! bounded-queue-plus-graceful-drain shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RecorderError, RecorderErrorKind};
use crate::hash;
use crate::record::{EvidenceRecord, MatchedRule, PolicyDecision};
use crate::storage::Storage;

/// Recorder configuration (spec §4.4 "Configuration (enumerated)").
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Master switch. When false, `record_request`/`record_response` are
    /// no-ops and no worker is spawned.
    pub enabled: bool,
    /// Bounded queue capacity between `record_response` and the worker.
    pub async_buffer: usize,
    /// Per-record storage-write deadline, and also the enqueue timeout.
    pub write_timeout: Duration,
    pub hash_request: bool,
    pub hash_response: bool,
    /// Whether API keys are hash-redacted before storage (spec §4.2 hash
    /// mode). When false, the key is stored exactly as given.
    pub redact_api_keys: bool,
    pub max_field_length: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            async_buffer: 1000,
            write_timeout: Duration::from_secs(5),
            hash_request: true,
            hash_response: true,
            redact_api_keys: true,
            max_field_length: 500,
        }
    }
}

/// Everything the proxy already knows about a request at policy-evaluation
/// time, before the upstream call is made.
#[derive(Debug, Clone, Default)]
pub struct RequestInput {
    pub request_id: String,
    pub request_time: Option<DateTime<Utc>>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub request_headers: HashMap<String, String>,
    pub request_body: Vec<u8>,

    pub model: Option<String>,
    pub provider: Option<String>,
    pub messages: Option<u32>,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub tools_used: Vec<String>,

    pub estimated_tokens: Option<i64>,
    pub estimated_cost: Option<Decimal>,
    pub risk_score: Option<u8>,
    pub complexity_score: Option<u8>,
    pub pii_detected: bool,
    pub pii_types: Vec<String>,

    pub policy_decision: Option<PolicyDecision>,
    pub matched_rules: Vec<MatchedRule>,
    pub block_reason: Option<String>,
    pub policy_version: Option<String>,

    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub ip_address: Option<String>,

    pub turn_number: Option<u32>,
    pub context_usage: Option<f64>,
}

/// Everything the proxy knows once the upstream call has returned (or
/// failed).
#[derive(Debug, Clone, Default)]
pub struct ResponseInput {
    pub request_id: String,
    pub response_time: Option<DateTime<Utc>>,
    pub response_body: Vec<u8>,
    pub response_status: Option<u16>,

    pub provider_call_time: Option<DateTime<Utc>>,
    pub provider_latency: Option<Duration>,
    pub provider_model: Option<String>,

    pub response_content: Option<String>,
    pub finish_reason: Option<String>,

    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub actual_cost: Option<Decimal>,

    pub error: Option<String>,
    pub error_type: Option<String>,
}

/// The two-phase correlation recorder.
///
/// Cheap to clone (an `Arc` internally); clone it into every task that needs
/// to call `record_request`/`record_response`.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderState>,
}

struct RecorderState {
    config: RecorderConfig,
    in_flight: DashMap<String, EvidenceRecord>,
    tx: Option<mpsc::Sender<EvidenceRecord>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// Build a recorder and, if `config.enabled`, spawn its background
    /// worker against `storage`. Must be called from within a Tokio runtime.
    pub fn new(config: RecorderConfig, storage: Arc<dyn Storage>) -> Self {
        let shutdown = CancellationToken::new();

        if !config.enabled {
            return Self {
                inner: Arc::new(RecorderState {
                    config,
                    in_flight: DashMap::new(),
                    tx: None,
                    shutdown,
                    worker: Mutex::new(None),
                }),
            };
        }

        let (tx, rx) = mpsc::channel(config.async_buffer.max(1));
        let write_timeout = config.write_timeout;
        let worker_cancel = shutdown.clone();
        let handle = tokio::spawn(run_worker(rx, storage, write_timeout, worker_cancel));

        Self {
            inner: Arc::new(RecorderState {
                config,
                in_flight: DashMap::new(),
                tx: Some(tx),
                shutdown,
                worker: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Record the request phase. Non-blocking: only touches the in-flight
    /// map. Returns the freshly assigned record id.
    pub fn record_request(&self, input: RequestInput) -> Uuid {
        let id = Uuid::new_v4();
        if !self.inner.config.enabled {
            return id;
        }

        let cfg = &self.inner.config;
        let now = Utc::now();

        let request_hash = if cfg.hash_request {
            hash::hash_body(&input.request_body)
        } else {
            String::new()
        };

        let api_key = input.api_key.map(|k| {
            if cfg.redact_api_keys {
                hash::redact_api_key_hash(&k)
            } else {
                k
            }
        });

        let record = EvidenceRecord {
            id,
            request_id: input.request_id.clone(),
            request_time: input.request_time.unwrap_or(now),
            policy_eval_time: Some(now),
            provider_call_time: None,
            response_time: None,
            recorded_time: now,
            request_hash,
            request_method: input.request_method,
            request_path: input.request_path,
            request_headers: input.request_headers,
            model: input.model,
            provider: input.provider,
            messages: input.messages,
            system_prompt: input
                .system_prompt
                .map(|s| hash::truncate_field(&s, cfg.max_field_length)),
            user_prompt: input
                .user_prompt
                .map(|s| hash::truncate_field(&s, cfg.max_field_length)),
            tools_used: input.tools_used,
            estimated_tokens: input.estimated_tokens,
            estimated_cost: input.estimated_cost,
            risk_score: input.risk_score,
            complexity_score: input.complexity_score,
            pii_detected: input.pii_detected,
            pii_types: input.pii_types,
            policy_decision: input.policy_decision,
            matched_rules: input.matched_rules,
            block_reason: input.block_reason,
            policy_version: input.policy_version,
            response_hash: None,
            response_status: None,
            response_content: None,
            finish_reason: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            actual_cost: None,
            provider_latency: None,
            provider_model: None,
            user_id: input.user_id,
            api_key,
            ip_address: input.ip_address,
            error: None,
            error_type: None,
            turn_number: input.turn_number,
            context_usage: input.context_usage,
        };

        self.inner.in_flight.insert(input.request_id, record);
        id
    }

    /// Record the response phase. Looks up and removes the partial record
    /// from the in-flight map, merges response fields, and attempts to
    /// enqueue for durable storage.
    ///
    /// Returns `Ok(())` when the record was queued (or when no prior
    /// request existed — spec §4.4 treats that as "nothing to persist", not
    /// an error). Returns `Err(RecorderError)` only when a correlated
    /// record was dropped due to queue saturation or shutdown; this is
    /// advisory and callers MUST NOT fail the proxy request over it.
    pub async fn record_response(&self, input: ResponseInput) -> Result<(), RecorderError> {
        if !self.inner.config.enabled {
            return Ok(());
        }

        let Some((_, mut record)) = self.inner.in_flight.remove(&input.request_id) else {
            debug!(request_id = %input.request_id, "response with no prior request; discarding");
            return Ok(());
        };

        let cfg = &self.inner.config;
        let now = Utc::now();

        record.response_time = Some(now);
        record.recorded_time = now;
        record.provider_call_time = input.provider_call_time.or(record.provider_call_time);
        record.response_hash = if cfg.hash_response {
            Some(hash::hash_body(&input.response_body))
        } else {
            None
        };
        record.response_status = input.response_status;
        record.provider_model = input.provider_model;
        record.provider_latency = input.provider_latency;
        record.response_content = input
            .response_content
            .map(|s| hash::truncate_field(&s, cfg.max_field_length));
        record.finish_reason = input.finish_reason;
        record.prompt_tokens = input.prompt_tokens;
        record.completion_tokens = input.completion_tokens;
        record.total_tokens = match (input.prompt_tokens, input.completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        };
        record.actual_cost = input.actual_cost;
        record.error = input.error;
        record.error_type = input.error_type;

        self.enqueue(record).await
    }

    async fn enqueue(&self, record: EvidenceRecord) -> Result<(), RecorderError> {
        let record_id = Some(record.id.to_string());

        let Some(tx) = self.inner.tx.as_ref() else {
            return Ok(());
        };

        if self.inner.shutdown.is_cancelled() {
            warn!(record_id = %record.id, "recorder is shutting down, dropping record");
            return Err(RecorderError::new(record_id, RecorderErrorKind::ShuttingDown));
        }

        match tokio::time::timeout(self.inner.config.write_timeout, tx.send(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_send_error)) => {
                warn!(record_id = ?record_id, "recorder queue closed, dropping record");
                Err(RecorderError::new(record_id, RecorderErrorKind::ShuttingDown))
            }
            Err(_elapsed) => {
                let timeout = self.inner.config.write_timeout;
                warn!(record_id = ?record_id, ?timeout, "enqueue deadline exceeded, dropping record");
                Err(RecorderError::new(
                    record_id,
                    RecorderErrorKind::EnqueueTimeout(timeout),
                ))
            }
        }
    }

    /// Signal shutdown and wait for the worker to drain every
    /// already-enqueued record before returning. Calls made after `close`
    /// returns see `shutdown = true` and are dropped with a
    /// `RecorderError::ShuttingDown`.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "recorder worker task panicked during shutdown");
            }
        }
    }

    /// Number of requests awaiting their response phase. Exposed for tests
    /// and operational introspection.
    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<EvidenceRecord>,
    storage: Arc<dyn Storage>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    info!("evidence recorder worker started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("recorder shutdown signalled, draining queue");
                rx.close();
                while let Some(record) = rx.recv().await {
                    write_one(&storage, record, write_timeout).await;
                }
                break;
            }

            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => write_one(&storage, record, write_timeout).await,
                    None => break,
                }
            }
        }
    }

    info!("evidence recorder worker drained and exited");
}

async fn write_one(storage: &Arc<dyn Storage>, record: EvidenceRecord, write_timeout: Duration) {
    let id = record.id;
    let started = std::time::Instant::now();
    let cancel = CancellationToken::new();

    let result = tokio::time::timeout(write_timeout, storage.store(record, &cancel)).await;
    let elapsed = started.elapsed();

    if elapsed > write_timeout / 2 {
        warn!(record_id = %id, ?elapsed, ?write_timeout, "evidence write exceeded half the write timeout");
    } else {
        debug!(record_id = %id, ?elapsed, "evidence record stored");
    }

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(record_id = %id, error = %e, "storage write failed, dropping record"),
        Err(_elapsed) => warn!(record_id = %id, ?write_timeout, "storage write deadline exceeded, dropping record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn request(request_id: &str) -> RequestInput {
        RequestInput {
            request_id: request_id.to_string(),
            model: Some("gpt-4".to_string()),
            policy_decision: Some(PolicyDecision::Allow),
            ..Default::default()
        }
    }

    fn response(request_id: &str) -> ResponseInput {
        ResponseInput {
            request_id: request_id.to_string(),
            response_status: Some(200),
            prompt_tokens: Some(50),
            completion_tokens: Some(20),
            actual_cost: Some(Decimal::new(7, 3)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn correlates_request_and_response_into_one_record() {
        let storage = Arc::new(MemoryBackend::new());
        let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

        recorder.record_request(request("r1"));
        recorder.record_response(response("r1")).await.unwrap();
        recorder.close().await;

        let cancel = CancellationToken::new();
        let count = storage.count(&crate::record::QueryFilter::new(), &cancel).await.unwrap();
        assert_eq!(count, 1);

        let records = storage.query(&crate::record::QueryFilter::new(), &cancel).await.unwrap();
        assert_eq!(records[0].request_id, "r1");
        assert_eq!(records[0].total_tokens, Some(70));
        assert_eq!(records[0].actual_cost, Some(Decimal::new(7, 3)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_all_enqueued_records_on_close() {
        let storage = Arc::new(MemoryBackend::new());
        let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

        for i in 0..10 {
            let id = format!("r{i}");
            recorder.record_request(request(&id));
            recorder.record_response(response(&id)).await.unwrap();
        }
        recorder.close().await;

        let cancel = CancellationToken::new();
        let count = storage.count(&crate::record::QueryFilter::new(), &cancel).await.unwrap();
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn response_without_request_records_nothing_and_does_not_error() {
        let storage = Arc::new(MemoryBackend::new());
        let recorder = Recorder::new(RecorderConfig::default(), storage.clone());

        recorder.record_response(response("orphan")).await.unwrap();
        recorder.close().await;

        let cancel = CancellationToken::new();
        let count = storage.count(&crate::record::QueryFilter::new(), &cancel).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn disabled_recorder_is_a_no_op() {
        let storage = Arc::new(MemoryBackend::new());
        let mut config = RecorderConfig::default();
        config.enabled = false;
        let recorder = Recorder::new(config, storage.clone());

        recorder.record_request(request("r1"));
        recorder.record_response(response("r1")).await.unwrap();
        recorder.close().await;

        let cancel = CancellationToken::new();
        let count = storage.count(&crate::record::QueryFilter::new(), &cancel).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn calls_after_close_are_dropped_with_shutdown_error() {
        let storage = Arc::new(MemoryBackend::new());
        let recorder = Recorder::new(RecorderConfig::default(), storage.clone());
        recorder.close().await;

        recorder.record_request(request("late"));
        let err = recorder.record_response(response("late")).await.unwrap_err();
        assert!(matches!(err.cause, RecorderErrorKind::ShuttingDown));
    }
}
