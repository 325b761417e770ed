//! Core data types used throughout the search gateway.
//!
//! These types flow through the query pipeline. The lifecycle for one
//! request is:
//!
//! ```text
//! QueryRequest → Intent → SqlArtifact → Verdict → SearchResult
//!                                          ↓
//!                                   PipelineEvent stream
//! ```
//!
//! # Type Relationships
//!
//! - A **[`QueryRequest`]** is the ephemeral, normalized form of one client
//!   request (query text, context map, options).
//! - An **[`Intent`]** is the classifier's structured reading of the query:
//!   kind, extracted entities, keywords, complexity and confidence.
//! - A **[`SqlArtifact`]** is a parameterized SQL candidate produced by a
//!   generator, with `%(name)s` placeholders bound in `parameters`.
//! - A **[`Verdict`]** is the safety validator's decision, carrying stable
//!   rule ids for every violated rule.
//! - A **[`SearchResult`]** is the formatted, paginated payload handed back
//!   to the client and stored in the result cache.
//! - A **[`PipelineEvent`]** is one entry in the per-request event stream
//!   tapped by the WebSocket dispatcher.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL generation strategy selecting which generators run and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// LLM first; on retriable exhaustion fall back to the rule generator.
    LlmFirst,
    /// Rule generator first; on no match or low confidence fall back to the LLM.
    RuleFirst,
    /// Run both in parallel under one deadline; keep the higher confidence.
    Hybrid,
    /// LLM only, no fallback.
    LlmOnly,
    /// Rule generator only, no fallback.
    RuleOnly,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LlmFirst => "llm_first",
            Strategy::RuleFirst => "rule_first",
            Strategy::Hybrid => "hybrid",
            Strategy::LlmOnly => "llm_only",
            Strategy::RuleOnly => "rule_only",
        }
    }

    pub fn parse(s: &str) -> Option<Strategy> {
        match s {
            "llm_first" => Some(Strategy::LlmFirst),
            "rule_first" => Some(Strategy::RuleFirst),
            "hybrid" => Some(Strategy::Hybrid),
            "llm_only" => Some(Strategy::LlmOnly),
            "rule_only" => Some(Strategy::RuleOnly),
            _ => None,
        }
    }
}

/// Per-request options, all optional on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    /// Requested deadline in seconds; clamped to the system maximum.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_true")]
    pub enable_highlighting: bool,
    /// Row cap, further bounded by the validator's mandatory LIMIT.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_strategy() -> Strategy {
    Strategy::LlmFirst
}
fn default_true() -> bool {
    true
}
fn default_limit() -> i64 {
    100
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::LlmFirst,
            timeout_seconds: None,
            use_cache: true,
            enable_highlighting: true,
            limit: 100,
        }
    }
}

/// One normalized client request. Ephemeral — lives for a single pipeline run.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Raw query text as received.
    pub raw_query: String,
    /// Lowercased, whitespace-collapsed query used for cache keys and
    /// analytics grouping.
    pub normalized_query: String,
    /// Free-form client context; keys are sorted for canonical hashing.
    pub context: BTreeMap<String, serde_json::Value>,
    pub options: SearchOptions,
    pub user_id: Option<i64>,
}

impl QueryRequest {
    pub fn new(
        query: &str,
        context: BTreeMap<String, serde_json::Value>,
        options: SearchOptions,
        user_id: Option<i64>,
    ) -> Self {
        Self {
            raw_query: query.to_string(),
            normalized_query: normalize_query(query),
            context,
            options,
            user_id,
        }
    }
}

/// Normalize a query for cache keys and analytics: lowercase and collapse
/// runs of whitespace to single spaces. Deterministic and idempotent.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Classified query kind. Precedence when several patterns match:
/// aggregation > join > filtering > simple_query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    SimpleQuery,
    Filtering,
    Aggregation,
    Join,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::SimpleQuery => "simple_query",
            IntentKind::Filtering => "filtering",
            IntentKind::Aggregation => "aggregation",
            IntentKind::Join => "join",
        }
    }
}

/// Kinds of entities the classifier extracts from query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CustomerName,
    Date,
    ProductName,
    Amount,
    Location,
    Keyword,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CustomerName => "customer_name",
            EntityKind::Date => "date",
            EntityKind::ProductName => "product_name",
            EntityKind::Amount => "amount",
            EntityKind::Location => "location",
            EntityKind::Keyword => "keyword",
        }
    }
}

/// Structured reading of one query. Classification never fails; a query with
/// no recognizable signal comes back as `simple_query` with low confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// Extracted entities, ordered as found, deduplicated. Kinds with no
    /// matches are omitted entirely.
    pub entities: BTreeMap<EntityKind, Vec<String>>,
    pub keywords: BTreeSet<String>,
    /// Query complexity in [0, 1].
    pub complexity: f64,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
}

impl Intent {
    /// Total number of extracted entity values across all kinds.
    pub fn entity_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    /// First value for a given entity kind, if any.
    pub fn first_entity(&self, kind: EntityKind) -> Option<&str> {
        self.entities
            .get(&kind)
            .and_then(|v| v.first())
            .map(String::as_str)
    }
}

/// Which generator produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    Rule,
    Llm,
    Hybrid,
}

impl SqlSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlSource::Rule => "rule",
            SqlSource::Llm => "llm",
            SqlSource::Hybrid => "hybrid",
        }
    }
}

/// A parameterized SQL candidate. Placeholders use the `%(name)s` style and
/// must correspond exactly to the keys of `parameters` — values are never
/// inlined into the SQL text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlArtifact {
    pub sql: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub explanation: String,
    pub confidence: f64,
    pub source: SqlSource,
}

impl SqlArtifact {
    /// Extract the set of `%(name)s` placeholder names from a SQL string.
    pub fn placeholders(sql: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let bytes = sql.as_bytes();
        let mut i = 0;
        while i + 2 < bytes.len() {
            if bytes[i] == b'%' && bytes[i + 1] == b'(' {
                if let Some(close) = sql[i + 2..].find(')') {
                    let name = &sql[i + 2..i + 2 + close];
                    let rest = &sql[i + 2 + close..];
                    if rest.len() >= 2 && rest.as_bytes()[1] == b's' && !name.is_empty() {
                        names.insert(name.to_string());
                        i += 2 + close + 2;
                        continue;
                    }
                }
            }
            i += 1;
        }
        names
    }

    /// True when the placeholder set and the parameter key set coincide.
    pub fn placeholders_bound(&self) -> bool {
        let names = Self::placeholders(&self.sql);
        names.len() == self.parameters.len()
            && names.iter().all(|n| self.parameters.contains_key(n))
    }
}

/// Stable identifiers for the validator's rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    TooLong,
    NonSelect,
    Destructive,
    SystemAccess,
    Injection,
    UnauthorizedTable,
    LimitExceeded,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::TooLong => "too_long",
            RuleId::NonSelect => "non_select",
            RuleId::Destructive => "destructive",
            RuleId::SystemAccess => "system_access",
            RuleId::Injection => "injection",
            RuleId::UnauthorizedTable => "unauthorized_table",
            RuleId::LimitExceeded => "limit_exceeded",
        }
    }
}

/// Outcome of safety validation. `accepted` holds exactly when `reasons`
/// is empty; `normalized_sql` is the SQL to execute (it may differ from the
/// input by an appended `LIMIT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    pub reasons: Vec<RuleId>,
    pub normalized_sql: String,
}

/// Pagination block computed by the formatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInfo {
    pub offset: i64,
    pub limit: i64,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

/// Compact summary of one result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: i64,
    pub columns: Vec<String>,
    pub strategy_used: Strategy,
    pub execution_time_ms: f64,
}

/// The formatted payload for one completed request. This is what the cache
/// stores and what `pipeline_complete` carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: i64,
    pub execution_time_ms: f64,
    pub strategy_used: Strategy,
    pub sql: SqlArtifact,
    pub intent: Intent,
    pub highlighted: bool,
    pub page: PageInfo,
    pub summary: ResultSummary,
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intent,
    SqlGen,
    Validate,
    Execute,
    Format,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intent => "intent",
            Stage::SqlGen => "sql_gen",
            Stage::Validate => "validate",
            Stage::Execute => "execute",
            Stage::Format => "format",
        }
    }
}

/// One entry in a request's event stream.
///
/// Ordering per request: `Start` first; for any stage S, `StageStart(S)`
/// precedes every `Token(_, S)` which precedes `StageEnd(S)`; at most one of
/// `PipelineComplete` / `Error`, and it terminates the stream. `CacheHit`
/// replaces the stage sequence entirely on a hit.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Start,
    StageStart(Stage),
    StageEnd { stage: Stage, duration_ms: f64 },
    Token { content: String, stage: Stage },
    CacheHit,
    PipelineComplete(Box<SearchResult>),
    Error { kind: &'static str, message: String },
}

/// One popular-query aggregate row, maintained by the analytics recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopularQuery {
    pub normalized_query: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
    /// Exponentially weighted moving average, seconds.
    pub avg_response_time: f64,
    pub success_rate: f64,
}
