//! Embedded relational `Storage` backend.
//!
//! WAL-mode SQLite behind an `r2d2` connection pool. Schema is created and
//! migrated idempotently on open, matching the `schema_version` metadata-row
//! pattern the sibling lifetime-stats store uses. Blocking rusqlite calls run
//! on `spawn_blocking` so the async runtime is never stalled by disk I/O.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{StorageError, StorageErrorKind};
use crate::record::{EvidenceRecord, MatchedRule, PolicyDecision, QueryFilter, SortField, SortOrder};

use super::{paginate, RecordStream, Storage};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// How the embedded backend is opened and pooled.
#[derive(Debug, Clone)]
pub struct SqliteBackendConfig {
    /// Path to the database file. `:memory:` is accepted for tests but
    /// forfeits durability across restarts.
    pub db_path: PathBuf,
    /// Read/write pool size. Writers serialize on SQLite's own lock; a
    /// modest pool mostly buys concurrent readers.
    pub max_connections: u32,
    /// `PRAGMA busy_timeout` in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/evidence.db"),
            max_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

/// An embedded, durable evidence store.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteBackend {
    /// Open (creating if necessary) the database at `config.db_path`,
    /// applying WAL mode and running migrations.
    pub fn open(config: SqliteBackendConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::new("sqlite", "open", StorageErrorKind::Io(e))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(&config.db_path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout={};
                 PRAGMA foreign_keys=ON;",
                config.busy_timeout_ms
            ))
        });
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .build(manager)
            .map_err(|e| StorageError::new("sqlite", "open", StorageErrorKind::Pool(e)))?;

        {
            let conn = pool
                .get()
                .map_err(|e| StorageError::new("sqlite", "open", StorageErrorKind::Pool(e)))?;
            init_schema(&conn).map_err(|e| StorageError::new("sqlite", "migrate", StorageErrorKind::Sqlite(e)))?;
        }

        let backend = Self { pool };
        backend.verify()?;
        Ok(backend)
    }

    fn get(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::new("sqlite", "get_connection", StorageErrorKind::Pool(e)))
    }

    /// Final step of the open sequence (spec §4.1: "... → verify"): round-trip
    /// a trivial query through the pool so a misconfigured or unreachable
    /// database surfaces immediately on open rather than on the first real
    /// write.
    fn verify(&self) -> Result<(), StorageError> {
        let conn = self.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| StorageError::new("sqlite", "verify", StorageErrorKind::Sqlite(e)))?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

         CREATE TABLE IF NOT EXISTS evidence_records (
             id TEXT PRIMARY KEY,
             request_id TEXT NOT NULL,
             request_time TEXT NOT NULL,
             policy_eval_time TEXT,
             provider_call_time TEXT,
             response_time TEXT,
             recorded_time TEXT NOT NULL,
             request_hash TEXT NOT NULL,
             request_method TEXT,
             request_path TEXT,
             request_headers TEXT NOT NULL,
             model TEXT,
             provider TEXT,
             messages INTEGER,
             system_prompt TEXT,
             user_prompt TEXT,
             tools_used TEXT NOT NULL,
             estimated_tokens INTEGER,
             estimated_cost TEXT,
             risk_score INTEGER,
             complexity_score INTEGER,
             pii_detected INTEGER NOT NULL,
             pii_types TEXT NOT NULL,
             policy_decision TEXT,
             matched_rules TEXT NOT NULL,
             block_reason TEXT,
             policy_version TEXT,
             response_hash TEXT,
             response_status INTEGER,
             response_content TEXT,
             finish_reason TEXT,
             prompt_tokens INTEGER,
             completion_tokens INTEGER,
             total_tokens INTEGER,
             actual_cost TEXT,
             provider_latency_ms INTEGER,
             provider_model TEXT,
             user_id TEXT,
             api_key TEXT,
             ip_address TEXT,
             error TEXT,
             error_type TEXT,
             turn_number INTEGER,
             context_usage REAL
         );

         CREATE INDEX IF NOT EXISTS idx_evidence_request_time ON evidence_records (request_time);
         CREATE INDEX IF NOT EXISTS idx_evidence_user_id ON evidence_records (user_id);
         CREATE INDEX IF NOT EXISTS idx_evidence_provider ON evidence_records (provider);
         CREATE INDEX IF NOT EXISTS idx_evidence_model ON evidence_records (model);
         CREATE INDEX IF NOT EXISTS idx_evidence_policy_decision ON evidence_records (policy_decision);
         CREATE INDEX IF NOT EXISTS idx_evidence_actual_cost ON evidence_records (actual_cost);
         CREATE INDEX IF NOT EXISTS idx_evidence_total_tokens ON evidence_records (total_tokens);
         CREATE INDEX IF NOT EXISTS idx_evidence_request_id ON evidence_records (request_id);",
    )?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![CURRENT_SCHEMA_VERSION],
            )?;
        }
        Some(v) if v < CURRENT_SCHEMA_VERSION => {
            // No migrations defined past v1 yet; bump in place once added.
            conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![CURRENT_SCHEMA_VERSION],
            )?;
        }
        Some(_) => {}
    }
    Ok(())
}

fn bind_matched_rules(rules: &[MatchedRule]) -> Result<String, serde_json::Error> {
    serde_json::to_string(rules)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EvidenceRecord> {
    let id: String = row.get("id")?;
    let request_headers: String = row.get("request_headers")?;
    let tools_used: String = row.get("tools_used")?;
    let pii_types: String = row.get("pii_types")?;
    let matched_rules: String = row.get("matched_rules")?;
    let estimated_cost: Option<String> = row.get("estimated_cost")?;
    let actual_cost: Option<String> = row.get("actual_cost")?;
    let policy_decision: Option<String> = row.get("policy_decision")?;
    let provider_latency_ms: Option<i64> = row.get("provider_latency_ms")?;

    Ok(EvidenceRecord {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        request_id: row.get("request_id")?,
        request_time: row.get("request_time")?,
        policy_eval_time: row.get("policy_eval_time")?,
        provider_call_time: row.get("provider_call_time")?,
        response_time: row.get("response_time")?,
        recorded_time: row.get("recorded_time")?,
        request_hash: row.get("request_hash")?,
        request_method: row.get("request_method")?,
        request_path: row.get("request_path")?,
        request_headers: serde_json::from_str(&request_headers).unwrap_or_default(),
        model: row.get("model")?,
        provider: row.get("provider")?,
        messages: row.get::<_, Option<i64>>("messages")?.map(|v| v as u32),
        system_prompt: row.get("system_prompt")?,
        user_prompt: row.get("user_prompt")?,
        tools_used: serde_json::from_str(&tools_used).unwrap_or_default(),
        estimated_tokens: row.get("estimated_tokens")?,
        estimated_cost: estimated_cost.and_then(|s| s.parse::<Decimal>().ok()),
        risk_score: row.get::<_, Option<i64>>("risk_score")?.map(|v| v as u8),
        complexity_score: row.get::<_, Option<i64>>("complexity_score")?.map(|v| v as u8),
        pii_detected: row.get::<_, i64>("pii_detected")? != 0,
        pii_types: serde_json::from_str(&pii_types).unwrap_or_default(),
        policy_decision: policy_decision.map(PolicyDecision::from),
        matched_rules: serde_json::from_str(&matched_rules).unwrap_or_default(),
        block_reason: row.get("block_reason")?,
        policy_version: row.get("policy_version")?,
        response_hash: row.get("response_hash")?,
        response_status: row.get::<_, Option<i64>>("response_status")?.map(|v| v as u16),
        response_content: row.get("response_content")?,
        finish_reason: row.get("finish_reason")?,
        prompt_tokens: row.get("prompt_tokens")?,
        completion_tokens: row.get("completion_tokens")?,
        total_tokens: row.get("total_tokens")?,
        actual_cost: actual_cost.and_then(|s| s.parse::<Decimal>().ok()),
        provider_latency: provider_latency_ms.map(|n| StdDuration::from_millis(n as u64)),
        provider_model: row.get("provider_model")?,
        user_id: row.get("user_id")?,
        api_key: row.get("api_key")?,
        ip_address: row.get("ip_address")?,
        error: row.get("error")?,
        error_type: row.get("error_type")?,
        turn_number: row.get::<_, Option<i64>>("turn_number")?.map(|v| v as u32),
        context_usage: row.get("context_usage")?,
    })
}

/// Translate a `QueryFilter` into a `WHERE` clause and its bound parameters.
fn build_where(filter: &QueryFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(start) = filter.start_time {
        clauses.push("request_time >= ?".to_string());
        binds.push(Box::new(start));
    }
    if let Some(end) = filter.end_time {
        clauses.push("request_time <= ?".to_string());
        binds.push(Box::new(end));
    }
    if let Some(ref v) = filter.user_id {
        clauses.push("user_id = ?".to_string());
        binds.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.api_key {
        clauses.push("api_key = ?".to_string());
        binds.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.provider {
        clauses.push("provider = ?".to_string());
        binds.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.model {
        clauses.push("model = ?".to_string());
        binds.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.policy_decision {
        clauses.push("policy_decision = ?".to_string());
        binds.push(Box::new(v.clone()));
    }
    if let Some(ref v) = filter.policy_id {
        clauses.push("matched_rules LIKE ?".to_string());
        binds.push(Box::new(format!("%\"policy_id\":\"{v}\"%")));
    }
    if let Some(ref v) = filter.rule_id {
        clauses.push("matched_rules LIKE ?".to_string());
        binds.push(Box::new(format!("%\"rule_id\":\"{v}\"%")));
    }
    if let Some(v) = filter.min_cost {
        clauses.push("CAST(actual_cost AS REAL) >= ?".to_string());
        binds.push(Box::new(v.to_string().parse::<f64>().unwrap_or(0.0)));
    }
    if let Some(v) = filter.max_cost {
        clauses.push("CAST(actual_cost AS REAL) <= ?".to_string());
        binds.push(Box::new(v.to_string().parse::<f64>().unwrap_or(0.0)));
    }
    if let Some(v) = filter.min_tokens {
        clauses.push("total_tokens >= ?".to_string());
        binds.push(Box::new(v));
    }
    if let Some(v) = filter.max_tokens {
        clauses.push("total_tokens <= ?".to_string());
        binds.push(Box::new(v));
    }
    if let Some(status) = filter.status {
        // Status is derived, not stored; translate per spec §3/§8 overlap
        // semantics rather than adding a redundant column.
        match status {
            crate::record::Status::Success => clauses.push("(error IS NULL OR error = '')".to_string()),
            crate::record::Status::Error => clauses.push("(error IS NOT NULL AND error != '')".to_string()),
            crate::record::Status::Blocked => clauses.push("policy_decision = 'block'".to_string()),
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_sql, binds)
}

fn order_by_sql(field: SortField, order: SortOrder) -> String {
    let column = match field {
        SortField::RequestTime => "request_time",
        SortField::RecordedTime => "recorded_time",
        SortField::ResponseTime => "response_time",
        SortField::ActualCost => "CAST(actual_cost AS REAL)",
        SortField::TotalTokens => "total_tokens",
        SortField::ProviderLatency => "provider_latency_ms",
    };
    let direction = match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    format!("ORDER BY {column} {direction}, id {direction}")
}

fn insert_record(conn: &Connection, record: &EvidenceRecord) -> Result<(), StorageError> {
    let matched_rules = bind_matched_rules(&record.matched_rules)
        .map_err(|e| StorageError::new("sqlite", "store", StorageErrorKind::Json(e)))?;
    let request_headers = serde_json::to_string(&record.request_headers)
        .map_err(|e| StorageError::new("sqlite", "store", StorageErrorKind::Json(e)))?;
    let tools_used = serde_json::to_string(&record.tools_used)
        .map_err(|e| StorageError::new("sqlite", "store", StorageErrorKind::Json(e)))?;
    let pii_types = serde_json::to_string(&record.pii_types)
        .map_err(|e| StorageError::new("sqlite", "store", StorageErrorKind::Json(e)))?;

    let result = conn.execute(
        "INSERT INTO evidence_records (
            id, request_id, request_time, policy_eval_time, provider_call_time, response_time,
            recorded_time, request_hash, request_method, request_path, request_headers,
            model, provider, messages, system_prompt, user_prompt, tools_used,
            estimated_tokens, estimated_cost, risk_score, complexity_score, pii_detected, pii_types,
            policy_decision, matched_rules, block_reason, policy_version,
            response_hash, response_status, response_content, finish_reason,
            prompt_tokens, completion_tokens, total_tokens, actual_cost,
            provider_latency_ms, provider_model, user_id, api_key, ip_address,
            error, error_type, turn_number, context_usage
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31,
            ?32, ?33, ?34, ?35, ?36, ?37, ?38, ?39, ?40, ?41, ?42, ?43
        )",
        params![
            record.id.to_string(),
            record.request_id,
            record.request_time,
            record.policy_eval_time,
            record.provider_call_time,
            record.response_time,
            record.recorded_time,
            record.request_hash,
            record.request_method,
            record.request_path,
            request_headers,
            record.model,
            record.provider,
            record.messages,
            record.system_prompt,
            record.user_prompt,
            tools_used,
            record.estimated_tokens,
            record.estimated_cost.map(|d| d.to_string()),
            record.risk_score.map(|v| v as i64),
            record.complexity_score.map(|v| v as i64),
            record.pii_detected as i64,
            pii_types,
            record.policy_decision.as_ref().map(|d| d.as_str().to_string()),
            matched_rules,
            record.block_reason,
            record.policy_version,
            record.response_hash,
            record.response_status.map(|v| v as i64),
            record.response_content,
            record.finish_reason,
            record.prompt_tokens,
            record.completion_tokens,
            record.total_tokens,
            record.actual_cost.map(|d| d.to_string()),
            record.provider_latency.map(|d| d.as_millis() as i64),
            record.provider_model,
            record.user_id,
            record.api_key,
            record.ip_address,
            record.error,
            record.error_type,
            record.turn_number,
            record.context_usage,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StorageError::new("sqlite", "store", StorageErrorKind::DuplicateId))
        }
        Err(e) => Err(StorageError::new("sqlite", "store", StorageErrorKind::Sqlite(e))),
    }
}

#[async_trait::async_trait]
impl Storage for SqliteBackend {
    async fn store(
        &self,
        record: EvidenceRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::new("sqlite", "store", StorageErrorKind::Cancelled));
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::new("sqlite", "store", StorageErrorKind::Pool(e)))?;
            insert_record(&conn, &record)
        })
        .await
        .map_err(|e| StorageError::new("sqlite", "store", StorageErrorKind::Other(e.to_string())))?
    }

    async fn query(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<EvidenceRecord>, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::new("sqlite", "query", StorageErrorKind::Cancelled));
        }
        let pool = self.pool.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::new("sqlite", "query", StorageErrorKind::Pool(e)))?;
            let (where_sql, binds) = build_where(&filter);
            let order_sql = order_by_sql(filter.effective_sort_by(), filter.effective_sort_order());
            let sql = format!("SELECT * FROM evidence_records {where_sql} {order_sql}");
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StorageError::new("sqlite", "query", StorageErrorKind::Sqlite(e)))?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), row_to_record)
                .map_err(|e| StorageError::new("sqlite", "query", StorageErrorKind::Sqlite(e)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| StorageError::new("sqlite", "query", StorageErrorKind::Sqlite(e)))?);
            }
            Ok(paginate(out, filter.effective_offset(), filter.effective_limit()))
        })
        .await
        .map_err(|e| StorageError::new("sqlite", "query", StorageErrorKind::Other(e.to_string())))?
    }

    fn query_stream(&self, filter: QueryFilter, cancel: CancellationToken) -> RecordStream {
        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel::<Result<EvidenceRecord, StorageError>>(128);

        tokio::task::spawn_blocking(move || {
            let send = |item: Result<EvidenceRecord, StorageError>| tx.blocking_send(item).is_ok();

            let conn = match pool.get() {
                Ok(c) => c,
                Err(e) => {
                    send(Err(StorageError::new("sqlite", "query_stream", StorageErrorKind::Pool(e))));
                    return;
                }
            };
            let (where_sql, binds) = build_where(&filter);
            let order_sql = order_by_sql(filter.effective_sort_by(), filter.effective_sort_order());
            let sql = format!("SELECT * FROM evidence_records {where_sql} {order_sql}");
            let mut stmt = match conn.prepare(&sql) {
                Ok(s) => s,
                Err(e) => {
                    send(Err(StorageError::new("sqlite", "query_stream", StorageErrorKind::Sqlite(e))));
                    return;
                }
            };
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = match stmt.query_map(param_refs.as_slice(), row_to_record) {
                Ok(r) => r,
                Err(e) => {
                    send(Err(StorageError::new("sqlite", "query_stream", StorageErrorKind::Sqlite(e))));
                    return;
                }
            };

            let offset = filter.effective_offset().max(0) as usize;
            let limit = filter.effective_limit().max(0) as usize;
            let mut skipped = 0usize;
            let mut emitted = 0usize;
            for row in rows {
                if cancel.is_cancelled() {
                    send(Err(StorageError::new("sqlite", "query_stream", StorageErrorKind::Cancelled)));
                    return;
                }
                if emitted >= limit {
                    break;
                }
                match row {
                    Ok(record) => {
                        if skipped < offset {
                            skipped += 1;
                            continue;
                        }
                        emitted += 1;
                        if !send(Ok(record)) {
                            return;
                        }
                    }
                    Err(e) => {
                        send(Err(StorageError::new("sqlite", "query_stream", StorageErrorKind::Sqlite(e))));
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn count(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<i64, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::new("sqlite", "count", StorageErrorKind::Cancelled));
        }
        let pool = self.pool.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::new("sqlite", "count", StorageErrorKind::Pool(e)))?;
            let (where_sql, binds) = build_where(&filter);
            let sql = format!("SELECT COUNT(*) FROM evidence_records {where_sql}");
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            conn.query_row(&sql, param_refs.as_slice(), |row| row.get::<_, i64>(0))
                .map_err(|e| StorageError::new("sqlite", "count", StorageErrorKind::Sqlite(e)))
        })
        .await
        .map_err(|e| StorageError::new("sqlite", "count", StorageErrorKind::Other(e.to_string())))?
    }

    async fn delete(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<i64, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::new("sqlite", "delete", StorageErrorKind::Cancelled));
        }
        let pool = self.pool.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::new("sqlite", "delete", StorageErrorKind::Pool(e)))?;
            let (where_sql, binds) = build_where(&filter);
            let sql = format!("DELETE FROM evidence_records {where_sql}");
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            conn.execute(&sql, param_refs.as_slice())
                .map(|n| n as i64)
                .map_err(|e| StorageError::new("sqlite", "delete", StorageErrorKind::Sqlite(e)))
        })
        .await
        .map_err(|e| StorageError::new("sqlite", "delete", StorageErrorKind::Other(e.to_string())))?
    }

    async fn close(&self) -> Result<(), StorageError> {
        // r2d2 connections are returned to the pool on drop; nothing to flush
        // explicitly with WAL mode. Kept as an explicit async point so callers
        // don't need to special-case this backend.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Status;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn record(id: Uuid, request_id: &str) -> EvidenceRecord {
        EvidenceRecord {
            id,
            request_id: request_id.to_string(),
            request_time: Utc::now(),
            policy_eval_time: None,
            provider_call_time: None,
            response_time: None,
            recorded_time: Utc::now(),
            request_hash: String::new(),
            request_method: None,
            request_path: None,
            request_headers: HashMap::new(),
            model: Some("gpt-4".to_string()),
            provider: Some("openai".to_string()),
            messages: None,
            system_prompt: None,
            user_prompt: None,
            tools_used: Vec::new(),
            estimated_tokens: None,
            estimated_cost: None,
            risk_score: None,
            complexity_score: None,
            pii_detected: false,
            pii_types: Vec::new(),
            policy_decision: None,
            matched_rules: Vec::new(),
            block_reason: None,
            policy_version: None,
            response_hash: None,
            response_status: None,
            response_content: None,
            finish_reason: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: Some(100),
            actual_cost: Some(Decimal::new(250, 2)),
            provider_latency: None,
            provider_model: None,
            user_id: Some("alice".to_string()),
            api_key: None,
            ip_address: None,
            error: None,
            error_type: None,
            turn_number: None,
            context_usage: None,
        }
    }

    fn open_test_backend() -> (SqliteBackend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("evidence.db");
        let backend = SqliteBackend::open(SqliteBackendConfig {
            db_path,
            ..Default::default()
        })
        .unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn store_then_query_round_trips() {
        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();
        backend.store(record(id, "req-1"), &cancel).await.unwrap();

        let filter = QueryFilter::new();
        let results = backend.query(&filter, &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
        assert_eq!(results[0].model.as_deref(), Some("gpt-4"));
        assert_eq!(results[0].actual_cost, Some(Decimal::new(250, 2)));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();
        backend.store(record(id, "req-a"), &cancel).await.unwrap();
        let err = backend.store(record(id, "req-b"), &cancel).await.unwrap_err();
        assert!(matches!(err.kind(), StorageErrorKind::DuplicateId));
    }

    #[tokio::test]
    async fn request_id_is_not_required_to_be_unique() {
        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        backend.store(record(Uuid::new_v4(), "shared"), &cancel).await.unwrap();
        backend.store(record(Uuid::new_v4(), "shared"), &cancel).await.unwrap();

        let mut filter = QueryFilter::new();
        filter.limit = Some(10);
        assert_eq!(backend.count(&filter, &cancel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn filters_translate_to_matching_rows() {
        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        backend.store(record(Uuid::new_v4(), "a"), &cancel).await.unwrap();
        let mut other = record(Uuid::new_v4(), "b");
        other.user_id = Some("bob".to_string());
        backend.store(other, &cancel).await.unwrap();

        let mut filter = QueryFilter::new();
        filter.user_id = Some("bob".to_string());
        let results = backend.query(&filter, &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn count_and_delete_agree_with_query() {
        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        for i in 0..3 {
            backend
                .store(record(Uuid::new_v4(), &format!("req-{i}")), &cancel)
                .await
                .unwrap();
        }
        let filter = QueryFilter::new();
        assert_eq!(backend.count(&filter, &cancel).await.unwrap(), 3);
        let deleted = backend.delete(&filter, &cancel).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(backend.count(&filter, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn query_stream_respects_limit_and_offset() {
        use futures::StreamExt;

        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        for i in 0..5 {
            backend
                .store(record(Uuid::new_v4(), &format!("req-{i}")), &cancel)
                .await
                .unwrap();
        }

        let mut filter = QueryFilter::new();
        filter.limit = Some(2);
        filter.offset = Some(1);
        let mut stream = backend.query_stream(filter, cancel);
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.unwrap());
        }
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn status_filter_matches_blocked_records() {
        let (backend, _dir) = open_test_backend();
        let cancel = CancellationToken::new();
        let mut r = record(Uuid::new_v4(), "blocked-1");
        r.policy_decision = Some(PolicyDecision::Block);
        backend.store(r, &cancel).await.unwrap();

        let mut filter = QueryFilter::new();
        filter.status = Some(Status::Blocked);
        assert_eq!(backend.count(&filter, &cancel).await.unwrap(), 1);
    }
}
