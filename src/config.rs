//! Crate-level configuration loading.
//!
//! Precedence mirrors the lineage this crate was generalized from:
//! environment variables beat a TOML config file, which beats the built-in
//! [`Default`] impls on [`RecorderConfig`], [`RetentionConfig`], and
//! [`SqliteBackendConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::recorder::RecorderConfig;
use crate::retention::RetentionConfig;
use crate::storage::SqliteBackendConfig;

/// Every config struct a host binary needs to wire up the evidence
/// pipeline: a [`Recorder`](crate::recorder::Recorder), a
/// [`RetentionScheduler`](crate::retention::RetentionScheduler), and the
/// embedded [`SqliteBackend`](crate::storage::SqliteBackend).
#[derive(Debug, Clone)]
pub struct EvidencePipelineConfig {
    pub recorder: RecorderConfig,
    pub retention: RetentionConfig,
    pub sqlite: SqliteBackendConfig,
}

impl Default for EvidencePipelineConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderConfig::default(),
            retention: RetentionConfig::default(),
            sqlite: SqliteBackendConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileRecorder {
    enabled: Option<bool>,
    async_buffer: Option<usize>,
    write_timeout_ms: Option<u64>,
    hash_request: Option<bool>,
    hash_response: Option<bool>,
    redact_api_keys: Option<bool>,
    max_field_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FileRetention {
    retention_days: Option<u32>,
    max_records: Option<u64>,
    prune_schedule: Option<String>,
    archive_before_delete: Option<bool>,
    archive_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileSqlite {
    db_path: Option<String>,
    max_connections: Option<u32>,
    busy_timeout_ms: Option<u32>,
}

/// Shape of the on-disk TOML file. Every section is optional; an absent
/// section falls all the way back to [`Default`].
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    recorder: Option<FileRecorder>,
    retention: Option<FileRetention>,
    sqlite: Option<FileSqlite>,
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EvidencePipelineConfig {
    /// Load configuration from env vars and built-in defaults only (no
    /// file). Convenient for tests and hosts that configure purely through
    /// the environment.
    pub fn from_env() -> Self {
        Self::build(FileConfig::default())
    }

    /// Load a TOML file at `path`, then apply environment overrides, then
    /// fall back to defaults for anything neither specifies.
    pub fn load(path: &Path) -> Self {
        let file = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to parse evidence pipeline config file, using defaults"
                );
                FileConfig::default()
            }),
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    path = %path.display(),
                    "evidence pipeline config file not found, using env/defaults"
                );
                FileConfig::default()
            }
        };
        Self::build(file)
    }

    fn build(file: FileConfig) -> Self {
        let defaults = RecorderConfig::default();
        let fr = file.recorder.unwrap_or_default();
        let recorder = RecorderConfig {
            enabled: env_var("EVIDENCE_RECORDER_ENABLED").or(fr.enabled).unwrap_or(defaults.enabled),
            async_buffer: env_var("EVIDENCE_RECORDER_ASYNC_BUFFER")
                .or(fr.async_buffer)
                .unwrap_or(defaults.async_buffer),
            write_timeout: env_var::<u64>("EVIDENCE_RECORDER_WRITE_TIMEOUT_MS")
                .or(fr.write_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_timeout),
            hash_request: fr.hash_request.unwrap_or(defaults.hash_request),
            hash_response: fr.hash_response.unwrap_or(defaults.hash_response),
            redact_api_keys: fr.redact_api_keys.unwrap_or(defaults.redact_api_keys),
            max_field_length: fr.max_field_length.unwrap_or(defaults.max_field_length),
        };

        let rdefaults = RetentionConfig::default();
        let ft = file.retention.unwrap_or_default();
        let retention = RetentionConfig {
            retention_days: env_var("EVIDENCE_RETENTION_DAYS")
                .or(ft.retention_days)
                .unwrap_or(rdefaults.retention_days),
            max_records: env_var("EVIDENCE_RETENTION_MAX_RECORDS")
                .or(ft.max_records)
                .unwrap_or(rdefaults.max_records),
            prune_schedule: std::env::var("EVIDENCE_RETENTION_SCHEDULE")
                .ok()
                .or(ft.prune_schedule)
                .unwrap_or(rdefaults.prune_schedule),
            archive_before_delete: env_var("EVIDENCE_RETENTION_ARCHIVE_BEFORE_DELETE")
                .or(ft.archive_before_delete)
                .unwrap_or(rdefaults.archive_before_delete),
            archive_path: std::env::var("EVIDENCE_RETENTION_ARCHIVE_PATH")
                .ok()
                .or(ft.archive_path)
                .map(PathBuf::from)
                .unwrap_or(rdefaults.archive_path),
        };

        let sdefaults = SqliteBackendConfig::default();
        let fs = file.sqlite.unwrap_or_default();
        let sqlite = SqliteBackendConfig {
            db_path: std::env::var("EVIDENCE_SQLITE_DB_PATH")
                .ok()
                .or(fs.db_path)
                .map(PathBuf::from)
                .unwrap_or(sdefaults.db_path),
            max_connections: env_var("EVIDENCE_SQLITE_MAX_CONNECTIONS")
                .or(fs.max_connections)
                .unwrap_or(sdefaults.max_connections),
            busy_timeout_ms: env_var("EVIDENCE_SQLITE_BUSY_TIMEOUT_MS")
                .or(fs.busy_timeout_ms)
                .unwrap_or(sdefaults.busy_timeout_ms),
        };

        Self { recorder, retention, sqlite }
    }
}
