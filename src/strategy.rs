//! Strategy scheduling for SQL generation.
//!
//! Orchestrates the rule generator and the retry-wrapped LLM generator
//! according to the requested strategy:
//!
//! | Strategy | Behavior |
//! |----------|----------|
//! | `rule_only` | rule generator once, no fallback |
//! | `llm_only` | LLM with retries, no fallback |
//! | `rule_first` | rule; on no match or confidence < 0.5, LLM with retries |
//! | `llm_first` | LLM with retries; on failure, rule |
//! | `hybrid` | both concurrently under one deadline; higher confidence wins, ties favor rule |
//!
//! For a fixed (strategy, intent) the scheduler is deterministic up to the
//! LLM's own nondeterminism. Timeouts and cancellation propagate as such —
//! only genuine generator failures become `generation_failed`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::{CancelToken, Deadline};
use crate::llm::{LlmClient, LlmSqlGenerator};
use crate::models::{Intent, SqlArtifact, Strategy};
use crate::retry::{run_with_retry, RetryConfig, RetryError};
use crate::rules::RuleBasedGenerator;

/// Rule confidence below this falls through to the LLM under `rule_first`.
const RULE_CONFIDENCE_FLOOR: f64 = 0.5;

/// Why generation did not produce an artifact.
#[derive(Debug)]
pub enum SchedulerError {
    /// All branches the strategy allows were exhausted. Carries one reason
    /// per failed branch.
    Failed(Vec<String>),
    Timeout,
    Canceled,
}

pub struct StrategyScheduler {
    rules: RuleBasedGenerator,
    llm: Option<LlmSqlGenerator<dyn LlmClient>>,
    retry: RetryConfig,
    llm_timeout: Duration,
}

impl StrategyScheduler {
    pub fn new(
        llm_client: Option<Arc<dyn LlmClient>>,
        retry: RetryConfig,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            rules: RuleBasedGenerator::new(),
            llm: llm_client.map(LlmSqlGenerator::new),
            retry,
            llm_timeout,
        }
    }

    /// Produce one artifact for the request, or a scheduler error.
    pub async fn generate(
        &self,
        strategy: Strategy,
        query: &str,
        intent: &Intent,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> Result<SqlArtifact, SchedulerError> {
        match strategy {
            Strategy::RuleOnly => self.rules.generate(intent).ok_or_else(|| {
                SchedulerError::Failed(vec!["rule: no_rule_match".to_string()])
            }),

            Strategy::LlmOnly => self
                .run_llm(query, intent, deadline, cancel)
                .await
                .map_err(|e| match e {
                    BranchError::Failed(reason) => SchedulerError::Failed(vec![reason]),
                    BranchError::Timeout => SchedulerError::Timeout,
                    BranchError::Canceled => SchedulerError::Canceled,
                }),

            Strategy::RuleFirst => {
                if let Some(artifact) = self.rules.generate(intent) {
                    if artifact.confidence >= RULE_CONFIDENCE_FLOOR {
                        return Ok(artifact);
                    }
                    debug!(
                        confidence = artifact.confidence,
                        "rule artifact below confidence floor, trying llm"
                    );
                }
                match self.run_llm(query, intent, deadline, cancel).await {
                    Ok(artifact) => Ok(artifact),
                    Err(BranchError::Timeout) => Err(SchedulerError::Timeout),
                    Err(BranchError::Canceled) => Err(SchedulerError::Canceled),
                    Err(BranchError::Failed(reason)) => Err(SchedulerError::Failed(vec![
                        "rule: no_rule_match or low confidence".to_string(),
                        format!("llm: {}", reason),
                    ])),
                }
            }

            Strategy::LlmFirst => match self.run_llm(query, intent, deadline, cancel).await {
                Ok(artifact) => Ok(artifact),
                Err(BranchError::Timeout) => Err(SchedulerError::Timeout),
                Err(BranchError::Canceled) => Err(SchedulerError::Canceled),
                Err(BranchError::Failed(reason)) => {
                    warn!(reason = %reason, "llm generation failed, falling back to rules");
                    self.rules.generate(intent).ok_or_else(|| {
                        SchedulerError::Failed(vec![
                            format!("llm: {}", reason),
                            "rule: no_rule_match".to_string(),
                        ])
                    })
                }
            },

            Strategy::Hybrid => self.run_hybrid(query, intent, deadline, cancel).await,
        }
    }

    /// Run both branches concurrently and keep the better artifact. Both
    /// branches share the request deadline; neither aborts the other, and
    /// the scheduler waits for both before choosing.
    async fn run_hybrid(
        &self,
        query: &str,
        intent: &Intent,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> Result<SqlArtifact, SchedulerError> {
        let rule_branch = async { self.rules.generate(intent) };
        let llm_branch = self.run_llm(query, intent, deadline, cancel);

        let (rule_result, llm_result) = tokio::join!(rule_branch, llm_branch);

        match (rule_result, llm_result) {
            (Some(rule), Ok(llm)) => {
                // Ties favor the deterministic branch.
                if llm.confidence > rule.confidence {
                    Ok(llm)
                } else {
                    Ok(rule)
                }
            }
            (Some(rule), Err(_)) => Ok(rule),
            (None, Ok(llm)) => Ok(llm),
            (None, Err(BranchError::Canceled)) => Err(SchedulerError::Canceled),
            (None, Err(BranchError::Timeout)) => Err(SchedulerError::Timeout),
            (None, Err(BranchError::Failed(reason))) => Err(SchedulerError::Failed(vec![
                "rule: no_rule_match".to_string(),
                format!("llm: {}", reason),
            ])),
        }
    }

    async fn run_llm(
        &self,
        query: &str,
        intent: &Intent,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> Result<SqlArtifact, BranchError> {
        let Some(llm) = self.llm.as_ref() else {
            return Err(BranchError::Failed("llm_unavailable".to_string()));
        };

        let call_timeout = deadline.bound(self.llm_timeout);
        let result = run_with_retry(&self.retry, deadline, cancel, || {
            llm.generate(query, intent, call_timeout)
        })
        .await;

        match result {
            Ok(artifact) => Ok(artifact),
            Err(RetryError::Inner(e)) => Err(BranchError::Failed(e.kind().to_string())),
            Err(RetryError::Timeout) => Err(BranchError::Timeout),
            Err(RetryError::Canceled) => Err(BranchError::Canceled),
        }
    }
}

enum BranchError {
    Failed(String),
    Timeout,
    Canceled,
}
