//! Evidence record schema and query filter types.
//!
//! `EvidenceRecord` is the unit of storage: one per request/response pair
//! flowing through the proxy. It is built in two passes by the recorder
//! (request phase, then response phase) and is immutable once handed to
//! storage.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single policy rule evaluation that contributed to a request's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub policy_id: String,
    pub rule_id: String,
    pub action: String,
    pub reason: Option<String>,
    /// Wire format is nanoseconds (spec §6: duration unit is inherited and
    /// documented explicitly rather than left ambiguous).
    #[serde(with = "duration_as_nanos")]
    pub evaluation_time: Duration,
}

/// The policy engine's decision for a request.
///
/// Tagged at the API boundary per spec §9 design notes, but the stored
/// (and wire) form stays a plain string for forward-compatibility with
/// actions this crate doesn't know about yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PolicyDecision {
    Allow,
    Block,
    Transform,
    Log,
    Route,
    /// Any action name not in the closed set above. Keeps the type
    /// future-proof against new policy engine actions.
    Other(String),
}

impl PolicyDecision {
    pub fn as_str(&self) -> &str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Block => "block",
            PolicyDecision::Transform => "transform",
            PolicyDecision::Log => "log",
            PolicyDecision::Route => "route",
            PolicyDecision::Other(s) => s,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, PolicyDecision::Block)
    }
}

impl From<&str> for PolicyDecision {
    fn from(s: &str) -> Self {
        match s {
            "allow" => PolicyDecision::Allow,
            "block" => PolicyDecision::Block,
            "transform" => PolicyDecision::Transform,
            "log" => PolicyDecision::Log,
            "route" => PolicyDecision::Route,
            other => PolicyDecision::Other(other.to_string()),
        }
    }
}

impl From<String> for PolicyDecision {
    fn from(s: String) -> Self {
        PolicyDecision::from(s.as_str())
    }
}

impl From<PolicyDecision> for String {
    fn from(d: PolicyDecision) -> Self {
        d.as_str().to_string()
    }
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The derived status of a record, used by the query filter's `status` field.
///
/// Per spec §3/§8: "success" and "blocked" are not mutually exclusive — a
/// blocked record that never set `error` satisfies both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
    Blocked,
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Status::Success),
            "error" => Ok(Status::Error),
            "blocked" => Ok(Status::Blocked),
            _ => Err(()),
        }
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::Blocked => "blocked",
        }
    }
}

/// Whitelisted sort columns for queries (spec §3/§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    RequestTime,
    RecordedTime,
    ResponseTime,
    ActualCost,
    TotalTokens,
    ProviderLatency,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::RequestTime => "request_time",
            SortField::RecordedTime => "recorded_time",
            SortField::ResponseTime => "response_time",
            SortField::ActualCost => "actual_cost",
            SortField::TotalTokens => "total_tokens",
            SortField::ProviderLatency => "provider_latency",
        }
    }
}

impl std::str::FromStr for SortField {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request_time" => Ok(SortField::RequestTime),
            "recorded_time" => Ok(SortField::RecordedTime),
            "response_time" => Ok(SortField::ResponseTime),
            "actual_cost" => Ok(SortField::ActualCost),
            "total_tokens" => Ok(SortField::TotalTokens),
            "provider_latency" => Ok(SortField::ProviderLatency),
            _ => Err(()),
        }
    }
}

impl Default for SortField {
    fn default() -> Self {
        SortField::RequestTime
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(()),
        }
    }
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// One request/response pair, captured by the recorder and handed to storage.
///
/// Fields grouped per spec §3. Most fields are optional because a record can
/// be stored while still partial (the response phase never arrived) — see
/// the recorder's in-flight map semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    // Identity
    pub id: Uuid,
    pub request_id: String,

    // Timestamps (UTC, RFC 3339 on the wire)
    pub request_time: DateTime<Utc>,
    pub policy_eval_time: Option<DateTime<Utc>>,
    pub provider_call_time: Option<DateTime<Utc>>,
    pub response_time: Option<DateTime<Utc>>,
    pub recorded_time: DateTime<Utc>,

    // Request metadata
    pub request_hash: String,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub request_headers: HashMap<String, String>,

    // Request content
    pub model: Option<String>,
    pub provider: Option<String>,
    pub messages: Option<u32>,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub tools_used: Vec<String>,

    // Scoring
    pub estimated_tokens: Option<i64>,
    pub estimated_cost: Option<Decimal>,
    pub risk_score: Option<u8>,
    pub complexity_score: Option<u8>,
    pub pii_detected: bool,
    pub pii_types: Vec<String>,

    // Policy
    pub policy_decision: Option<PolicyDecision>,
    pub matched_rules: Vec<MatchedRule>,
    pub block_reason: Option<String>,
    pub policy_version: Option<String>,

    // Response metadata
    pub response_hash: Option<String>,
    pub response_status: Option<u16>,

    // Response content
    pub response_content: Option<String>,
    pub finish_reason: Option<String>,

    // Usage
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub actual_cost: Option<Decimal>,

    // Provider
    #[serde(with = "opt_duration_as_nanos")]
    pub provider_latency: Option<Duration>,
    pub provider_model: Option<String>,

    // Identity/caller
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub ip_address: Option<String>,

    // Error
    pub error: Option<String>,
    pub error_type: Option<String>,

    // Conversation
    pub turn_number: Option<u32>,
    pub context_usage: Option<f64>,
}

impl EvidenceRecord {
    /// A record with empty `error` is "success" (spec §3/§8).
    pub fn is_success(&self) -> bool {
        self.error.as_deref().unwrap_or("").is_empty()
    }

    /// A record with non-empty `error` is "error".
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// A record with `policy_decision == "block"` is "blocked", regardless
    /// of whether `error` is also set.
    pub fn is_blocked(&self) -> bool {
        matches!(&self.policy_decision, Some(d) if d.is_block())
    }

    pub fn matches_status(&self, status: Status) -> bool {
        match status {
            Status::Success => self.is_success(),
            Status::Error => self.is_error(),
            Status::Blocked => self.is_blocked(),
        }
    }
}

/// Filter describing which records a query/count/delete operation targets.
///
/// All fields are optional; an absent field imposes no constraint. Non-range
/// conditions combine conjunctively (AND) per spec §4.1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub policy_decision: Option<String>,
    pub policy_id: Option<String>,
    pub rule_id: Option<String>,

    pub min_cost: Option<Decimal>,
    pub max_cost: Option<Decimal>,
    pub min_tokens: Option<i64>,
    pub max_tokens: Option<i64>,

    pub status: Option<Status>,

    pub limit: Option<i64>,
    pub offset: Option<i64>,

    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortOrder>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective limit after defaults: 100 when unset or explicitly zero.
    pub fn effective_limit(&self) -> i64 {
        match self.limit {
            None | Some(0) => 100,
            Some(n) => n,
        }
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0)
    }

    pub fn effective_sort_by(&self) -> SortField {
        self.sort_by.unwrap_or_default()
    }

    pub fn effective_sort_order(&self) -> SortOrder {
        self.sort_order.unwrap_or_default()
    }
}

/// Serializes a `Duration` as whole nanoseconds (spec §6).
mod duration_as_nanos {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

mod opt_duration_as_nanos {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let nanos: Option<u64> = Option::deserialize(d)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> EvidenceRecord {
        EvidenceRecord {
            id: Uuid::new_v4(),
            request_id: "r1".to_string(),
            request_time: Utc::now(),
            policy_eval_time: None,
            provider_call_time: None,
            response_time: None,
            recorded_time: Utc::now(),
            request_hash: String::new(),
            request_method: None,
            request_path: None,
            request_headers: HashMap::new(),
            model: None,
            provider: None,
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
            total_tokens: None,
            actual_cost: None,
            provider_latency: None,
            provider_model: None,
            user_id: None,
            api_key: None,
            ip_address: None,
            error: None,
            error_type: None,
            turn_number: None,
            context_usage: None,
        }
    }

    #[test]
    fn status_overlap_blocked_without_error() {
        let mut r = base_record();
        r.policy_decision = Some(PolicyDecision::Block);
        r.error = None;
        assert!(r.matches_status(Status::Success));
        assert!(r.matches_status(Status::Blocked));
        assert!(!r.matches_status(Status::Error));
    }

    #[test]
    fn status_error_excludes_success() {
        let mut r = base_record();
        r.error = Some("timeout".to_string());
        assert!(r.matches_status(Status::Error));
        assert!(!r.matches_status(Status::Success));
    }

    #[test]
    fn policy_decision_roundtrips_unknown_actions() {
        let d = PolicyDecision::from("route_fallback");
        assert_eq!(d.as_str(), "route_fallback");
        assert!(matches!(d, PolicyDecision::Other(_)));
    }

    #[test]
    fn query_filter_defaults() {
        let f = QueryFilter::new();
        assert_eq!(f.effective_limit(), 100);
        assert_eq!(f.effective_offset(), 0);
        assert_eq!(f.effective_sort_by(), SortField::RequestTime);
        assert_eq!(f.effective_sort_order(), SortOrder::Desc);
    }
}
