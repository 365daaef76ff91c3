//! Shared filter-matching and sort logic for the in-memory backend, and a
//! reference the SQL backend's translated `WHERE`/`ORDER BY` clauses are
//! checked against in tests.

use crate::record::{EvidenceRecord, QueryFilter, SortField, SortOrder};

/// Whether `record` satisfies every condition in `filter` (spec §4.1: "all
/// filters conjunctively").
pub(crate) fn record_matches(record: &EvidenceRecord, filter: &QueryFilter) -> bool {
    if let Some(start) = filter.start_time {
        if record.request_time < start {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if record.request_time > end {
            return false;
        }
    }
    if let Some(ref user_id) = filter.user_id {
        if record.user_id.as_deref() != Some(user_id.as_str()) {
            return false;
        }
    }
    if let Some(ref api_key) = filter.api_key {
        if record.api_key.as_deref() != Some(api_key.as_str()) {
            return false;
        }
    }
    if let Some(ref provider) = filter.provider {
        if record.provider.as_deref() != Some(provider.as_str()) {
            return false;
        }
    }
    if let Some(ref model) = filter.model {
        if record.model.as_deref() != Some(model.as_str()) {
            return false;
        }
    }
    if let Some(ref decision) = filter.policy_decision {
        if record.policy_decision.as_ref().map(|d| d.as_str()) != Some(decision.as_str()) {
            return false;
        }
    }
    // policy_id / rule_id: substring containment over the serialized
    // matched-rules, per spec §4.1's explicit design trade-off (case
    // sensitive, no junction table).
    if let Some(ref policy_id) = filter.policy_id {
        if !record.matched_rules.iter().any(|r| &r.policy_id == policy_id) {
            return false;
        }
    }
    if let Some(ref rule_id) = filter.rule_id {
        if !record.matched_rules.iter().any(|r| &r.rule_id == rule_id) {
            return false;
        }
    }
    if let Some(min_cost) = filter.min_cost {
        if record.actual_cost.map_or(true, |c| c < min_cost) {
            return false;
        }
    }
    if let Some(max_cost) = filter.max_cost {
        if record.actual_cost.map_or(true, |c| c > max_cost) {
            return false;
        }
    }
    if let Some(min_tokens) = filter.min_tokens {
        if record.total_tokens.map_or(true, |t| t < min_tokens) {
            return false;
        }
    }
    if let Some(max_tokens) = filter.max_tokens {
        if record.total_tokens.map_or(true, |t| t > max_tokens) {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if !record.matches_status(status) {
            return false;
        }
    }
    true
}

fn sort_value(record: &EvidenceRecord, field: SortField) -> Option<i128> {
    match field {
        SortField::RequestTime => Some(record.request_time.timestamp_nanos_opt().unwrap_or(0) as i128),
        SortField::RecordedTime => Some(record.recorded_time.timestamp_nanos_opt().unwrap_or(0) as i128),
        SortField::ResponseTime => record
            .response_time
            .and_then(|t| t.timestamp_nanos_opt())
            .map(|n| n as i128),
        SortField::ActualCost => record
            .actual_cost
            .map(|c| (c * rust_decimal::Decimal::new(1_000_000, 0)).mantissa() as i128),
        SortField::TotalTokens => record.total_tokens.map(|t| t as i128),
        SortField::ProviderLatency => record.provider_latency.map(|d| d.as_nanos() as i128),
    }
}

/// Sort `records` in place by `field`/`order`. Absent values sort before
/// present ones regardless of direction (same as `Option`'s derived `Ord`).
pub(crate) fn sort_records(records: &mut [EvidenceRecord], field: SortField, order: SortOrder) {
    records.sort_by(|a, b| {
        let ord = sort_value(a, field).cmp(&sort_value(b, field));
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}
