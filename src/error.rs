//! Error taxonomy for the query pipeline.
//!
//! Terminal errors abort the pipeline and surface exactly once, as an
//! `error` event on the stream and as an HTTP failure body. Cache and
//! analytics errors never reach this type — those subsystems degrade to
//! no-ops and log instead.

use thiserror::Error;

use crate::models::RuleId;

/// A terminal pipeline error, as surfaced to clients.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Malformed request: empty query, unknown strategy, oversized context.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Every configured generation strategy was exhausted.
    #[error("sql generation failed")]
    GenerationFailed { reasons: Vec<String> },

    /// The safety validator rejected the generated SQL. Carries rule ids
    /// only — the offending SQL is never echoed back.
    #[error("query rejected by safety validator")]
    Security { rules: Vec<RuleId> },

    /// Database failure while executing validated SQL.
    #[error("query execution failed: {0}")]
    Runtime(String),

    /// The per-request deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// A streaming client fell too far behind the event bus.
    #[error("client cannot keep up with the event stream")]
    Backpressure,

    /// The client disconnected before completion.
    #[error("request canceled")]
    Canceled,
}

impl SearchError {
    /// Stable kind string used in event payloads and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::Validation(_) => "validation",
            SearchError::GenerationFailed { .. } => "generation_failed",
            SearchError::Security { .. } => "security",
            SearchError::Runtime(_) => "runtime",
            SearchError::Timeout => "timeout",
            SearchError::Backpressure => "backpressure",
            SearchError::Canceled => "canceled",
        }
    }

    /// Message safe to hand to clients. For security rejections this lists
    /// rule ids, never SQL text.
    pub fn client_message(&self) -> String {
        match self {
            SearchError::Security { rules } => {
                let ids: Vec<&str> = rules.iter().map(|r| r.as_str()).collect();
                format!("rejected by safety rules: {}", ids.join(", "))
            }
            SearchError::GenerationFailed { reasons } => {
                format!("sql generation failed: {}", reasons.join("; "))
            }
            other => other.to_string(),
        }
    }
}

/// Failures from the LLM generator. Only some of these are worth retrying.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Provider not configured or hard-rejected the request (4xx).
    #[error("llm unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its own timeout.
    #[error("llm call timed out")]
    Timeout,

    /// The response could not be parsed into a SQL artifact, even after
    /// the repair pass.
    #[error("llm response malformed: {0}")]
    Malformed(String),

    /// Connection-level failure or 5xx from the provider.
    #[error("transient network failure: {0}")]
    Network(String),
}

impl LlmError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::Malformed(_) | LlmError::Network(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Unavailable(_) => "llm_unavailable",
            LlmError::Timeout => "llm_timeout",
            LlmError::Malformed(_) => "llm_malformed",
            LlmError::Network(_) => "transient_network",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_message_lists_rule_ids_only() {
        let err = SearchError::Security {
            rules: vec![RuleId::Destructive, RuleId::Injection],
        };
        let msg = err.client_message();
        assert!(msg.contains("destructive"));
        assert!(msg.contains("injection"));
        assert!(!msg.to_lowercase().contains("drop table"));
    }

    #[test]
    fn retriable_classification() {
        assert!(LlmError::Timeout.is_retriable());
        assert!(LlmError::Malformed("x".into()).is_retriable());
        assert!(LlmError::Network("reset".into()).is_retriable());
        assert!(!LlmError::Unavailable("no key".into()).is_retriable());
    }
}
