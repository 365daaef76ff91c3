//! The storage contract (spec §4.1) and its two backends.
//!
//! `Storage` is the abstraction everything else in this crate — the
//! recorder, the pruner, the exporters — is written against. The in-memory
//! backend (`memory`) is the reference implementation used in tests; the
//! embedded relational backend (`sqlite`) is the durable one.

mod filter;
pub mod memory;
pub mod sqlite;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::record::{EvidenceRecord, QueryFilter};

pub use memory::MemoryBackend;
pub use sqlite::{SqliteBackend, SqliteBackendConfig};

/// A finite or incremental stream of stored records paired with their
/// terminal error, if any. Producers must check `cancel` between every
/// record (spec §4.1/§5) and report a terminal error exactly once, as the
/// last item the stream yields.
pub type RecordStream = BoxStream<'static, Result<EvidenceRecord, StorageError>>;

/// Operations every evidence store must support. All methods are safe for
/// concurrent invocation (spec §4.1 "Concurrency contract").
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Append-only persistence. Duplicate `id` or I/O failure is an error.
    async fn store(
        &self,
        record: EvidenceRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    /// Apply filter conjunctively, sort, offset, then limit (default 100);
    /// return a materialized sequence.
    async fn query(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<EvidenceRecord>, StorageError>;

    /// Same semantics as `query`, yielded incrementally. The consumer drives
    /// pacing by pulling; the producer must observe `cancel` between every
    /// record.
    fn query_stream(&self, filter: QueryFilter, cancel: CancellationToken) -> RecordStream;

    /// Same filter semantics as `query`, without materializing records.
    async fn count(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<i64, StorageError>;

    /// Delete matching records; returns the count deleted.
    async fn delete(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<i64, StorageError>;

    /// Release resources. Subsequent operations fail.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Applies a filter's offset/limit pagination to an already-sorted,
/// already-filtered sequence. Shared by both backends so pagination math
/// can't drift between them.
pub(crate) fn paginate<T>(mut items: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
    let offset = offset.max(0) as usize;
    let limit = limit.max(0) as usize;
    if offset >= items.len() {
        return Vec::new();
    }
    items.drain(..offset);
    items.truncate(limit);
    items
}
