//! Evidence pipeline for an LLM proxy.
//!
//! This crate is the durable, queryable audit trail of every request/response
//! pair flowing through a proxy: it correlates a request phase with a later
//! response phase into one [`record::EvidenceRecord`], persists it through a
//! pluggable [`storage::Storage`] backend, and offers retention pruning and
//! streaming export on top.
//!
//! It has no binary target and performs no authentication, policy
//! evaluation, or cost estimation of its own — it records what it is told by
//! an embedding proxy. See each module's docs for its slice of the pipeline:
//!
//! - [`record`] — the record schema and query filter.
//! - [`hash`] — body hashing, API-key redaction, field truncation.
//! - [`validate`] — query filter validation and defaults.
//! - [`storage`] — the storage contract plus the in-memory and embedded
//!   relational backends.
//! - [`recorder`] — the two-phase correlation recorder.
//! - [`retention`] — age/count pruning and the cron-driven scheduler.
//! - [`export`] — streaming JSON and CSV exporters.
//! - [`config`] — layered configuration loading for all of the above.
//! - [`error`] — the typed error taxonomy shared across the crate.

pub mod config;
pub mod error;
pub mod export;
pub mod hash;
pub mod record;
pub mod recorder;
pub mod retention;
pub mod storage;
pub(crate) mod util;
pub mod validate;
