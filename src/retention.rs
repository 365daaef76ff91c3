//! Retention pruner and cron-driven scheduler (spec §4.5/§4.6).
//!
//! The pruner runs two independent phases — age-based and count-based — each
//! of which may optionally archive records to a pretty-JSON file before
//! deleting them. The scheduler wraps the pruner in a `tokio-cron-scheduler`
//! job and guarantees any in-flight prune completes before `stop`/context
//! cancellation returns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid as JobUuid;

use crate::error::{RetentionError, RetentionErrorKind};
use crate::export::{export_json, JsonExportOptions};
use crate::record::{QueryFilter, SortField, SortOrder};
use crate::storage::Storage;

/// Retention configuration (spec §4.5 "Configuration (enumerated)").
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// 0 disables age-based pruning.
    pub retention_days: u32,
    /// 0 disables count-based pruning.
    pub max_records: u64,
    /// Cron expression; empty disables scheduling.
    pub prune_schedule: String,
    pub archive_before_delete: bool,
    pub archive_path: PathBuf,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            max_records: 0,
            prune_schedule: "0 3 * * *".to_string(),
            archive_before_delete: false,
            archive_path: PathBuf::from("./archive"),
        }
    }
}

/// Runs age-based and count-based pruning against a [`Storage`] backend.
pub struct Pruner {
    storage: Arc<dyn Storage>,
    config: RetentionConfig,
}

impl Pruner {
    pub fn new(config: RetentionConfig, storage: Arc<dyn Storage>) -> Self {
        Self { storage, config }
    }

    /// Run both phases (each independently may be a no-op). Returns the
    /// total number of records deleted. Either phase failing aborts the
    /// whole run.
    pub async fn prune(&self) -> Result<u64, RetentionError> {
        let span = info_span!("evidence_retention_prune", retention_days = self.config.retention_days);
        async {
            let cancel = CancellationToken::new();
            let mut deleted = 0u64;

            if self.config.retention_days > 0 {
                deleted += self.prune_by_age(&cancel).await?;
            }
            if self.config.max_records > 0 {
                deleted += self.prune_by_count(&cancel).await?;
            }

            info!(deleted, "retention prune complete");
            Ok(deleted)
        }
        .instrument(span)
        .await
    }

    async fn prune_by_age(&self, cancel: &CancellationToken) -> Result<u64, RetentionError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days as i64);

        let mut filter = QueryFilter::new();
        filter.end_time = Some(cutoff);
        filter.limit = Some(i64::MAX);

        if self.config.archive_before_delete {
            let records = self
                .storage
                .query(&filter, cancel)
                .await
                .map_err(|e| RetentionError::new(self.config.retention_days, e))?;
            if !records.is_empty() {
                let name = format!("evidence-{}.json", Utc::now().format("%Y-%m-%d"));
                self.write_archive(&name, &records).await?;
            }
        }

        let deleted = self
            .storage
            .delete(&filter, cancel)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;
        debug!(deleted, cutoff = %cutoff, "age-based prune phase done");
        Ok(deleted as u64)
    }

    async fn prune_by_count(&self, cancel: &CancellationToken) -> Result<u64, RetentionError> {
        let total = self
            .storage
            .count(&QueryFilter::new(), cancel)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;

        if total <= self.config.max_records as i64 {
            return Ok(0);
        }

        let mut filter = QueryFilter::new();
        filter.limit = Some(i64::MAX);
        filter.sort_by = Some(SortField::RequestTime);
        filter.sort_order = Some(SortOrder::Asc);

        // Re-query rather than trust `total`: the set may have changed
        // between the count above and now, so "records to delete" is
        // recomputed from this fresh query's length (spec §4.5).
        let all = self
            .storage
            .query(&filter, cancel)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;

        let excess = all.len().saturating_sub(self.config.max_records as usize);
        if excess == 0 {
            return Ok(0);
        }
        let selected = &all[..excess];

        if self.config.archive_before_delete {
            let name = format!("evidence-count-{}.json", Utc::now().format("%Y-%m-%d-%H%M%S"));
            self.write_archive(&name, selected).await?;
        }

        let cutoff_time = selected
            .last()
            .expect("excess > 0 implies selected is non-empty")
            .request_time;

        let mut delete_filter = QueryFilter::new();
        delete_filter.end_time = Some(cutoff_time);
        let deleted = self
            .storage
            .delete(&delete_filter, cancel)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;
        debug!(deleted, excess, "count-based prune phase done");
        Ok(deleted as u64)
    }

    async fn write_archive(
        &self,
        file_name: &str,
        records: &[crate::record::EvidenceRecord],
    ) -> Result<(), RetentionError> {
        let dir = self.config.archive_path.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;
        set_archive_dir_permissions(&dir)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;

        let json = export_json(records, JsonExportOptions { pretty: true })
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;

        let path = dir.join(file_name);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| RetentionError::new(self.config.retention_days, e))?;
        info!(path = %path.display(), count = records.len(), "wrote retention archive");
        Ok(())
    }
}

#[cfg(unix)]
async fn set_archive_dir_permissions(dir: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o755);
    tokio::fs::set_permissions(dir, perms).await
}

#[cfg(not(unix))]
async fn set_archive_dir_permissions(_dir: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

/// `tokio-cron-scheduler` parses Quartz-style expressions with a leading
/// seconds field; spec §6 specifies the standard five-field grammar
/// (`min hour dom mon dow`). Five-field input gets `0 ` prefixed for
/// seconds; anything else (already 6/7 fields) passes through unchanged.
fn quartz_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Cron-driven loop that fires the pruner on a schedule (spec §4.6).
///
/// Cheap to clone; the scheduler engine lives behind a shared `Arc`.
#[derive(Clone)]
pub struct RetentionScheduler {
    pruner: Arc<Pruner>,
    schedule: String,
    engine: Arc<AsyncMutex<Option<(JobScheduler, JobUuid)>>>,
    /// Held by the running job for its whole duration, so `stop` can block
    /// on acquiring it to guarantee any in-flight prune has finished.
    run_lock: Arc<AsyncMutex<()>>,
    running: Arc<AtomicBool>,
}

impl RetentionScheduler {
    pub fn new(config: RetentionConfig, storage: Arc<dyn Storage>) -> Self {
        let schedule = config.prune_schedule.clone();
        Self {
            pruner: Arc::new(Pruner::new(config, storage)),
            schedule,
            engine: Arc::new(AsyncMutex::new(None)),
            run_lock: Arc::new(AsyncMutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the cron loop. A no-op (returns `Ok`, `is_running` stays false)
    /// when the configured schedule is empty. Returns an error for an
    /// invalid cron expression or if the scheduler engine fails to start.
    /// `cancel` mirrors `stop`: cancelling it also waits for any in-flight
    /// prune before the scheduler is torn down.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), RetentionError> {
        if self.schedule.trim().is_empty() {
            return Ok(());
        }

        let mut guard = self.engine.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let pruner = self.pruner.clone();
        let run_lock = self.run_lock.clone();
        let expr = quartz_cron_expr(&self.schedule);
        let job = Job::new_async(expr.as_str(), move |_uuid, _scheduler| {
            let pruner = pruner.clone();
            let run_lock = run_lock.clone();
            Box::pin(async move {
                let _guard = run_lock.lock().await;
                if let Err(e) = pruner.prune().await {
                    error!(error = %e, "scheduled retention prune failed");
                }
            })
        })
        .map_err(|e| RetentionError::new(0, RetentionErrorKind::Scheduler(e.to_string())))?;

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| RetentionError::new(0, RetentionErrorKind::Scheduler(e.to_string())))?;
        let job_id = scheduler
            .add(job)
            .await
            .map_err(|e| RetentionError::new(0, RetentionErrorKind::Scheduler(e.to_string())))?;
        scheduler
            .start()
            .await
            .map_err(|e| RetentionError::new(0, RetentionErrorKind::Scheduler(e.to_string())))?;

        *guard = Some((scheduler, job_id));
        self.running.store(true, Ordering::SeqCst);
        drop(guard);

        let self_clone = self.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            self_clone.stop().await;
        });

        info!(schedule = %self.schedule, "retention scheduler started");
        Ok(())
    }

    /// Stop the scheduler, waiting for any in-flight prune to complete.
    /// Safe to call when not running. Supports repeated start/stop cycles.
    pub async fn stop(&self) {
        let mut guard = self.engine.lock().await;
        if let Some((mut scheduler, _job_id)) = guard.take() {
            if let Err(e) = scheduler.shutdown().await {
                error!(error = %e, "retention scheduler shutdown reported an error");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        drop(guard);

        // Block until any in-flight job releases this lock.
        let _ = self.run_lock.lock().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Next scheduled fire time, or `None` when not running.
    pub async fn next_run(&self) -> Option<DateTime<Utc>> {
        let guard = self.engine.lock().await;
        let (scheduler, job_id) = guard.as_ref()?;
        scheduler.next_tick_for_job(*job_id).await.ok().flatten()
    }
}
