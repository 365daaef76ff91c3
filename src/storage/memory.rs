//! In-memory reference `Storage` backend.
//!
//! Linear-scan filtering over a `Vec` guarded by a `std::sync::Mutex`. This
//! is the backend the rest of the crate's tests are written against: no
//! disk, no pool, no migrations — just the contract, exercised honestly.
//! Not intended for production use (spec §4.1 component table).

use std::sync::Mutex;

use async_stream::try_stream;
use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageErrorKind};
use crate::record::{EvidenceRecord, QueryFilter};

use super::filter::{record_matches, sort_records};
use super::{paginate, RecordStream, Storage};

/// An in-memory evidence store. Cheap to construct; cloning the `Arc` you
/// wrap it in is the intended way to share it across tasks.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<EvidenceRecord>>,
    closed: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if *self.closed.lock().expect("lock poisoned") {
            return Err(StorageError::new(
                "memory",
                "backend is closed",
                StorageErrorKind::Closed,
            ));
        }
        Ok(())
    }

    fn snapshot(&self, filter: &QueryFilter) -> Vec<EvidenceRecord> {
        let records = self.records.lock().expect("lock poisoned");
        let mut matched: Vec<EvidenceRecord> = records
            .iter()
            .filter(|r| record_matches(r, filter))
            .cloned()
            .collect();
        sort_records(&mut matched, filter.effective_sort_by(), filter.effective_sort_order());
        matched
    }
}

#[async_trait::async_trait]
impl Storage for MemoryBackend {
    async fn store(
        &self,
        record: EvidenceRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(StorageError::new("memory", "store", StorageErrorKind::Cancelled));
        }
        let mut records = self.records.lock().expect("lock poisoned");
        if records.iter().any(|r| r.id == record.id) {
            return Err(StorageError::new(
                "memory",
                "store",
                StorageErrorKind::DuplicateId,
            ));
        }
        records.push(record);
        Ok(())
    }

    async fn query(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<EvidenceRecord>, StorageError> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(StorageError::new("memory", "query", StorageErrorKind::Cancelled));
        }
        let matched = self.snapshot(filter);
        Ok(paginate(matched, filter.effective_offset(), filter.effective_limit()))
    }

    fn query_stream(&self, filter: QueryFilter, cancel: CancellationToken) -> RecordStream {
        let matched = self.snapshot(&filter);
        let page = paginate(matched, filter.effective_offset(), filter.effective_limit());
        Box::pin(try_stream! {
            for record in page {
                if cancel.is_cancelled() {
                    Err(StorageError::new("memory", "query_stream", StorageErrorKind::Cancelled))?;
                }
                yield record;
            }
        })
    }

    async fn count(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<i64, StorageError> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(StorageError::new("memory", "count", StorageErrorKind::Cancelled));
        }
        let records = self.records.lock().expect("lock poisoned");
        Ok(records.iter().filter(|r| record_matches(r, filter)).count() as i64)
    }

    async fn delete(
        &self,
        filter: &QueryFilter,
        cancel: &CancellationToken,
    ) -> Result<i64, StorageError> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(StorageError::new("memory", "delete", StorageErrorKind::Cancelled));
        }
        let mut records = self.records.lock().expect("lock poisoned");
        let before = records.len();
        records.retain(|r| !record_matches(r, filter));
        Ok((before - records.len()) as i64)
    }

    async fn close(&self) -> Result<(), StorageError> {
        *self.closed.lock().expect("lock poisoned") = true;
        Ok(())
    }
}
