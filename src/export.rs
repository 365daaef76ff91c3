//! Streaming JSON and CSV export (spec §4.7).
//!
//! Both exporters accept either a materialized slice of records or the lazy
//! [`RecordStream`] produced by `Storage::query_stream`, and write to a
//! caller-provided sink. Streaming variants never hold more than one record
//! in memory at a time; the CSV writer flushes every 100 records so a slow
//! consumer sees progress and the internal buffer stays bounded.

use futures::StreamExt;
use rust_decimal::prelude::ToPrimitive;

use crate::error::{ExportError, ExportErrorKind};
use crate::record::EvidenceRecord;
use crate::storage::RecordStream;
use tokio_util::sync::CancellationToken;

/// The fixed, ordered CSV column set (spec §6).
pub const CSV_COLUMNS: &[&str] = &[
    "id",
    "request_id",
    "request_time",
    "policy_eval_time",
    "provider_call_time",
    "response_time",
    "recorded_time",
    "request_hash",
    "request_method",
    "request_path",
    "request_headers",
    "model",
    "provider",
    "messages",
    "system_prompt",
    "user_prompt",
    "tools_used",
    "estimated_tokens",
    "estimated_cost",
    "risk_score",
    "complexity_score",
    "pii_detected",
    "pii_types",
    "policy_decision",
    "matched_rules",
    "block_reason",
    "policy_version",
    "response_hash",
    "response_status",
    "response_content",
    "finish_reason",
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "actual_cost",
    "provider_latency_ms",
    "provider_model",
    "user_id",
    "api_key",
    "ip_address",
    "error",
    "error_type",
    "turn_number",
    "context_usage",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExportOptions {
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CsvExportOptions {
    pub include_header: bool,
}

impl Default for CsvExportOptions {
    fn default() -> Self {
        Self { include_header: true }
    }
}

/// How many records between flushes of the CSV writer (spec §4.7).
const CSV_FLUSH_INTERVAL: usize = 100;

fn json_of(record: &EvidenceRecord, pretty: bool) -> Result<String, serde_json::Error> {
    if pretty {
        serde_json::to_string_pretty(record)
    } else {
        serde_json::to_string(record)
    }
}

/// Export a materialized sequence of records to JSON.
///
/// Empty input produces `[]`. A single record is emitted as a bare object,
/// not wrapped in an array; two or more are emitted as an array (spec §4.7).
pub fn export_json(records: &[EvidenceRecord], options: JsonExportOptions) -> Result<String, ExportError> {
    let result = match records {
        [] => Ok("[]".to_string()),
        [single] => json_of(single, options.pretty),
        many => {
            if options.pretty {
                serde_json::to_string_pretty(many)
            } else {
                serde_json::to_string(many)
            }
        }
    };
    result.map_err(|e| ExportError::new("json", records.len(), e))
}

/// Export a lazy record stream to JSON. Always emits an array, regardless of
/// how many records the stream yields, since the exporter can't know the
/// count in advance. On cancellation, returns the cancellation error
/// immediately without writing a closing bracket — the output is explicitly
/// truncated.
pub async fn export_json_stream(
    mut stream: RecordStream,
    options: JsonExportOptions,
    cancel: &CancellationToken,
    sink: &mut impl std::io::Write,
) -> Result<usize, ExportError> {
    let mut count = 0usize;

    if cancel.is_cancelled() {
        return Err(ExportError::new("json", count, ExportErrorKind::Cancelled));
    }
    sink.write_all(b"[").map_err(|e| ExportError::new("json", count, e))?;

    let mut first = true;
    loop {
        if cancel.is_cancelled() {
            return Err(ExportError::new("json", count, ExportErrorKind::Cancelled));
        }
        match stream.next().await {
            None => break,
            Some(Err(e)) => return Err(ExportError::new("json", count, ExportErrorKind::Storage(e))),
            Some(Ok(record)) => {
                if !first {
                    let sep = if options.pretty { ",\n" } else { "," };
                    sink.write_all(sep.as_bytes()).map_err(|e| ExportError::new("json", count, e))?;
                }
                first = false;
                let json = json_of(&record, options.pretty).map_err(|e| ExportError::new("json", count, e))?;
                sink.write_all(json.as_bytes()).map_err(|e| ExportError::new("json", count, e))?;
                count += 1;
            }
        }
    }

    sink.write_all(b"]").map_err(|e| ExportError::new("json", count, e))?;
    Ok(count)
}

fn opt_string<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn cost_string(value: Option<rust_decimal::Decimal>) -> String {
    match value {
        None => String::new(),
        Some(d) => format!("{:.6}", d.to_f64().unwrap_or(0.0)),
    }
}

fn json_string<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Flatten one record into the fixed CSV column order (spec §6/§4.7).
fn record_to_csv_row(r: &EvidenceRecord) -> Vec<String> {
    vec![
        r.id.to_string(),
        r.request_id.clone(),
        r.request_time.to_rfc3339(),
        r.policy_eval_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        r.provider_call_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        r.response_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        r.recorded_time.to_rfc3339(),
        r.request_hash.clone(),
        r.request_method.clone().unwrap_or_default(),
        r.request_path.clone().unwrap_or_default(),
        json_string(&r.request_headers),
        r.model.clone().unwrap_or_default(),
        r.provider.clone().unwrap_or_default(),
        opt_string(r.messages),
        r.system_prompt.clone().unwrap_or_default(),
        r.user_prompt.clone().unwrap_or_default(),
        json_string(&r.tools_used),
        opt_string(r.estimated_tokens),
        cost_string(r.estimated_cost),
        opt_string(r.risk_score),
        opt_string(r.complexity_score),
        r.pii_detected.to_string(),
        json_string(&r.pii_types),
        r.policy_decision.as_ref().map(|d| d.as_str().to_string()).unwrap_or_default(),
        json_string(&r.matched_rules),
        r.block_reason.clone().unwrap_or_default(),
        r.policy_version.clone().unwrap_or_default(),
        r.response_hash.clone().unwrap_or_default(),
        opt_string(r.response_status),
        r.response_content.clone().unwrap_or_default(),
        r.finish_reason.clone().unwrap_or_default(),
        opt_string(r.prompt_tokens),
        opt_string(r.completion_tokens),
        opt_string(r.total_tokens),
        cost_string(r.actual_cost),
        opt_string(r.provider_latency.map(|d| d.as_millis() as i64)),
        r.provider_model.clone().unwrap_or_default(),
        r.user_id.clone().unwrap_or_default(),
        r.api_key.clone().unwrap_or_default(),
        r.ip_address.clone().unwrap_or_default(),
        r.error.clone().unwrap_or_default(),
        r.error_type.clone().unwrap_or_default(),
        opt_string(r.turn_number),
        r.context_usage.map(|v| format!("{v:.2}")).unwrap_or_default(),
    ]
}

/// Export a materialized sequence of records to CSV.
pub fn export_csv(
    records: &[EvidenceRecord],
    options: CsvExportOptions,
    sink: impl std::io::Write,
) -> Result<usize, ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(sink);
    if options.include_header {
        writer
            .write_record(CSV_COLUMNS)
            .map_err(|e| ExportError::new("csv", 0, e))?;
    }
    for (i, record) in records.iter().enumerate() {
        writer
            .write_record(record_to_csv_row(record))
            .map_err(|e| ExportError::new("csv", i, e))?;
        if (i + 1) % CSV_FLUSH_INTERVAL == 0 {
            writer.flush().map_err(|e| ExportError::new("csv", i + 1, e))?;
        }
    }
    writer
        .flush()
        .map_err(|e| ExportError::new("csv", records.len(), e))?;
    Ok(records.len())
}

/// Export a lazy record stream to CSV, flushing every 100 records (spec
/// §4.7). On cancellation, flushes what is staged and returns the
/// cancellation error.
pub async fn export_csv_stream(
    mut stream: RecordStream,
    options: CsvExportOptions,
    cancel: &CancellationToken,
    sink: impl std::io::Write,
) -> Result<usize, ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(sink);
    let mut count = 0usize;

    if cancel.is_cancelled() {
        return Err(ExportError::new("csv", count, ExportErrorKind::Cancelled));
    }
    if options.include_header {
        writer
            .write_record(CSV_COLUMNS)
            .map_err(|e| ExportError::new("csv", count, e))?;
    }

    loop {
        if cancel.is_cancelled() {
            writer.flush().map_err(|e| ExportError::new("csv", count, e))?;
            return Err(ExportError::new("csv", count, ExportErrorKind::Cancelled));
        }
        match stream.next().await {
            None => break,
            Some(Err(e)) => {
                writer.flush().map_err(|e| ExportError::new("csv", count, e))?;
                return Err(ExportError::new("csv", count, ExportErrorKind::Storage(e)));
            }
            Some(Ok(record)) => {
                writer
                    .write_record(record_to_csv_row(&record))
                    .map_err(|e| ExportError::new("csv", count, e))?;
                count += 1;
                if count % CSV_FLUSH_INTERVAL == 0 {
                    writer.flush().map_err(|e| ExportError::new("csv", count, e))?;
                }
            }
        }
    }

    writer.flush().map_err(|e| ExportError::new("csv", count, e))?;
    Ok(count)
}
