//! Error taxonomy (spec §7).
//!
//! Five kinds, each carrying the context spec.md names. Storage and query
//! errors surface to their caller unchanged; recorder errors are advisory;
//! retention errors are logged by the scheduler, not re-thrown; export
//! errors are fatal to the export only.

use thiserror::Error;

/// Underlying cause of a [`StorageError`].
#[derive(Debug, Error)]
pub enum StorageErrorKind {
    #[error("duplicate record id")]
    DuplicateId,
    #[error("backend closed")]
    Closed,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Persistence failure: connect, open, read, write, schema, scan.
#[derive(Debug, Error)]
#[error("storage error: backend `{backend}`, operation `{operation}`: {cause}")]
pub struct StorageError {
    pub backend: String,
    pub operation: String,
    #[source]
    pub cause: StorageErrorKind,
}

impl StorageError {
    pub fn new(
        backend: impl Into<String>,
        operation: impl Into<String>,
        cause: impl Into<StorageErrorKind>,
    ) -> Self {
        Self {
            backend: backend.into(),
            operation: operation.into(),
            cause: cause.into(),
        }
    }

    pub fn kind(&self) -> &StorageErrorKind {
        &self.cause
    }
}

impl From<String> for StorageErrorKind {
    fn from(s: String) -> Self {
        StorageErrorKind::Other(s)
    }
}

impl From<&str> for StorageErrorKind {
    fn from(s: &str) -> Self {
        StorageErrorKind::Other(s.to_string())
    }
}

/// Underlying cause of a [`QueryError`].
#[derive(Debug, Error)]
pub enum QueryErrorKind {
    #[error("limit out of range")]
    LimitOutOfRange,
    #[error("offset out of range")]
    OffsetOutOfRange,
    #[error("unknown sort_by field")]
    UnknownSortField,
    #[error("unknown sort_order")]
    UnknownSortOrder,
    #[error("start_time is after end_time")]
    TimeRangeInverted,
    #[error("min_cost is greater than max_cost")]
    CostRangeInverted,
    #[error("min_tokens is greater than max_tokens")]
    TokenRangeInverted,
    #[error("unknown status value")]
    UnknownStatus,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Filter validation or execution failure.
#[derive(Debug, Error)]
#[error("query error ({filter}): {cause}")]
pub struct QueryError {
    /// Debug rendering of the offending filter, for diagnostics.
    pub filter: String,
    #[source]
    pub cause: QueryErrorKind,
}

impl QueryError {
    pub fn new(filter: impl Into<String>, cause: QueryErrorKind) -> Self {
        Self {
            filter: filter.into(),
            cause,
        }
    }
}

/// Underlying cause of a [`RecorderError`]: the record was dropped.
#[derive(Debug, Error)]
pub enum RecorderErrorKind {
    #[error("enqueue timed out after {0:?}")]
    EnqueueTimeout(std::time::Duration),
    #[error("recorder is shutting down")]
    ShuttingDown,
}

/// Advisory error returned when a record could not be queued. The proxy
/// must not treat this as a request failure (spec §4.4/§7).
#[derive(Debug, Error)]
#[error("recorder dropped record {record_id:?}: {cause}")]
pub struct RecorderError {
    pub record_id: Option<String>,
    #[source]
    pub cause: RecorderErrorKind,
}

impl RecorderError {
    pub fn new(record_id: Option<String>, cause: RecorderErrorKind) -> Self {
        Self { record_id, cause }
    }
}

/// Underlying cause of a [`RetentionError`].
#[derive(Debug, Error)]
pub enum RetentionErrorKind {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Cron expression rejected, or the scheduler engine itself failed to
    /// start/stop.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Pruning failure; escalated by the scheduler via logging, never re-thrown.
#[derive(Debug, Error)]
#[error("retention error (retention_days={retention_days}): {cause}")]
pub struct RetentionError {
    pub retention_days: u32,
    #[source]
    pub cause: RetentionErrorKind,
}

impl RetentionError {
    pub fn new(retention_days: u32, cause: impl Into<RetentionErrorKind>) -> Self {
        Self {
            retention_days,
            cause: cause.into(),
        }
    }
}

/// Underlying cause of an [`ExportError`].
#[derive(Debug, Error)]
pub enum ExportErrorKind {
    #[error("export cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Writer failure during export; surfaced to the caller immediately.
#[derive(Debug, Error)]
#[error("export error (format={format}, record_count={record_count}): {cause}")]
pub struct ExportError {
    pub format: String,
    pub record_count: usize,
    #[source]
    pub cause: ExportErrorKind,
}

impl ExportError {
    pub fn new(format: impl Into<String>, record_count: usize, cause: impl Into<ExportErrorKind>) -> Self {
        Self {
            format: format.into(),
            record_count,
            cause: cause.into(),
        }
    }
}
