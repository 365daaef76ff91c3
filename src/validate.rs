//! Query filter validation and default application (spec §4.3).

use crate::error::{QueryError, QueryErrorKind};
use crate::record::{QueryFilter, SortField, SortOrder};

/// Hard cap on `limit`, regardless of what the caller asks for.
pub const MAX_LIMIT: i64 = 10_000;

/// Validate a filter, rejecting the conditions spec §4.3 enumerates.
///
/// Rejections: `limit < 0`, `limit > 10_000`, `offset < 0`, unknown
/// `sort_by`/`sort_order` (as raw strings — this crate's `QueryFilter`
/// already types those fields, so an out-of-range value can only arrive via
/// a deserialized wire request; see [`validate_raw`] for that path),
/// `start_time > end_time`, `min_cost > max_cost`, `min_tokens > max_tokens`.
pub fn validate(filter: &QueryFilter) -> Result<(), QueryError> {
    let debug = format!("{filter:?}");

    if let Some(limit) = filter.limit {
        if limit < 0 {
            return Err(QueryError::new(debug, QueryErrorKind::LimitOutOfRange));
        }
        if limit > MAX_LIMIT {
            return Err(QueryError::new(debug, QueryErrorKind::LimitOutOfRange));
        }
    }

    if let Some(offset) = filter.offset {
        if offset < 0 {
            return Err(QueryError::new(debug, QueryErrorKind::OffsetOutOfRange));
        }
    }

    if let (Some(start), Some(end)) = (filter.start_time, filter.end_time) {
        if start > end {
            return Err(QueryError::new(debug, QueryErrorKind::TimeRangeInverted));
        }
    }

    if let (Some(min), Some(max)) = (filter.min_cost, filter.max_cost) {
        if min > max {
            return Err(QueryError::new(debug, QueryErrorKind::CostRangeInverted));
        }
    }

    if let (Some(min), Some(max)) = (filter.min_tokens, filter.max_tokens) {
        if min > max {
            return Err(QueryError::new(debug, QueryErrorKind::TokenRangeInverted));
        }
    }

    Ok(())
}

/// Validate raw (string-typed) sort fields/order as they'd arrive off the
/// wire, before they're parsed into [`SortField`]/[`SortOrder`]. Returns the
/// parsed values on success.
pub fn validate_sort(
    sort_by: Option<&str>,
    sort_order: Option<&str>,
) -> Result<(Option<SortField>, Option<SortOrder>), QueryError> {
    let debug = format!("sort_by={sort_by:?}, sort_order={sort_order:?}");

    let sort_by = sort_by
        .map(|s| s.parse::<SortField>())
        .transpose()
        .map_err(|_| QueryError::new(debug.clone(), QueryErrorKind::UnknownSortField))?;

    let sort_order = sort_order
        .map(|s| s.parse::<SortOrder>())
        .transpose()
        .map_err(|_| QueryError::new(debug, QueryErrorKind::UnknownSortOrder))?;

    Ok((sort_by, sort_order))
}

/// Apply documented defaults. Idempotent: applying twice equals applying
/// once (spec §8).
pub fn apply_defaults(filter: &mut QueryFilter) {
    filter.limit = Some(filter.effective_limit());
    filter.sort_by = Some(filter.effective_sort_by());
    filter.sort_order = Some(filter.effective_sort_order());
    if filter.offset.is_none() {
        filter.offset = Some(0);
    }
}

/// Validate then apply defaults, the sequence every storage backend should
/// run filters through before executing them.
pub fn validate_and_normalize(mut filter: QueryFilter) -> Result<QueryFilter, QueryError> {
    validate(&filter)?;
    apply_defaults(&mut filter);
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn rejects_negative_limit() {
        let mut f = QueryFilter::new();
        f.limit = Some(-1);
        assert!(validate(&f).is_err());
    }

    #[test]
    fn rejects_limit_over_cap() {
        let mut f = QueryFilter::new();
        f.limit = Some(MAX_LIMIT + 1);
        assert!(validate(&f).is_err());
    }

    #[test]
    fn rejects_negative_offset() {
        let mut f = QueryFilter::new();
        f.offset = Some(-1);
        assert!(validate(&f).is_err());
    }

    #[test]
    fn rejects_inverted_time_range() {
        let mut f = QueryFilter::new();
        let now = Utc::now();
        f.start_time = Some(now);
        f.end_time = Some(now - ChronoDuration::seconds(1));
        assert!(validate(&f).is_err());
    }

    #[test]
    fn rejects_inverted_cost_range() {
        use rust_decimal::Decimal;
        let mut f = QueryFilter::new();
        f.min_cost = Some(Decimal::new(200, 2));
        f.max_cost = Some(Decimal::new(100, 2));
        assert!(validate(&f).is_err());
    }

    #[test]
    fn defaults_apply_once_equals_twice() {
        let mut f = QueryFilter::new();
        apply_defaults(&mut f);
        let once = f.clone();
        apply_defaults(&mut f);
        assert_eq!(once.limit, f.limit);
        assert_eq!(once.sort_by, f.sort_by);
        assert_eq!(once.sort_order, f.sort_order);
        assert_eq!(once.offset, f.offset);
    }

    #[test]
    fn unknown_sort_field_rejected() {
        assert!(validate_sort(Some("bogus_column"), None).is_err());
    }
}
