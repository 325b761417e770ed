//! LLM-backed SQL generation.
//!
//! Defines the [`LlmClient`] trait and the OpenAI chat-completions
//! implementation, plus the response parser that turns model output into a
//! [`SqlArtifact`]. Malformed output gets exactly one repair pass: the first
//! balanced `{…}` block is extracted and re-parsed before giving up.
//!
//! # Error classification
//!
//! | Failure | Error | Retriable |
//! |---------|-------|-----------|
//! | missing API key, 4xx (not 429) | `llm_unavailable` | no |
//! | call exceeded its timeout | `llm_timeout` | yes |
//! | unparseable response after repair | `llm_malformed` | yes |
//! | connection error, 429, 5xx | `transient_network` | yes |

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::LlmError;
use crate::models::{Intent, SqlArtifact, SqlSource};
use crate::prompt::render_sql_prompt;

/// Confidence assigned when the model does not report one.
const DEFAULT_LLM_CONFIDENCE: f64 = 0.7;

/// One-shot text completion against a language model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier, for logs and analytics.
    fn model_name(&self) -> &str;

    /// Send `prompt` and return the raw text response within `timeout`.
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError>;
}

// ============ OpenAI chat completions client ============

/// [`LlmClient`] over the OpenAI chat-completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable. Retry policy lives in
/// [`crate::retry`] — this client classifies failures and returns.
pub struct OpenAiClient {
    model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(model: &str) -> Result<Self, LlmError> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(LlmError::Unavailable(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        Ok(Self {
            model: model.to_string(),
            http,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Unavailable("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Network(format!("API error {}: {}", status, text)));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!(
                "API error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".to_string()))
    }
}

// ============ SQL generator over any client ============

/// Shape the model is instructed to respond with.
#[derive(Debug, Deserialize)]
struct LlmSqlPayload {
    sql: String,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct LlmSqlGenerator<C: LlmClient + ?Sized> {
    client: std::sync::Arc<C>,
}

impl<C: LlmClient + ?Sized> LlmSqlGenerator<C> {
    pub fn new(client: std::sync::Arc<C>) -> Self {
        Self { client }
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// Prompt the model and parse its answer into an artifact.
    pub async fn generate(
        &self,
        query: &str,
        intent: &Intent,
        timeout: Duration,
    ) -> Result<SqlArtifact, LlmError> {
        let prompt = render_sql_prompt(query, intent);
        let response = self.client.complete(&prompt, timeout).await?;
        parse_sql_response(&response)
    }
}

/// Parse model output into a [`SqlArtifact`]: strict JSON first, then one
/// repair pass over the first balanced `{…}` block.
pub fn parse_sql_response(text: &str) -> Result<SqlArtifact, LlmError> {
    let strict: Result<LlmSqlPayload, _> = serde_json::from_str(text.trim());
    let payload = match strict {
        Ok(p) => p,
        Err(_) => {
            let block = extract_balanced_block(text)
                .ok_or_else(|| LlmError::Malformed("no JSON object in response".to_string()))?;
            serde_json::from_str::<LlmSqlPayload>(block)
                .map_err(|e| LlmError::Malformed(format!("repair pass failed: {}", e)))?
        }
    };

    if payload.sql.trim().is_empty() {
        return Err(LlmError::Malformed("empty sql field".to_string()));
    }

    let artifact = SqlArtifact {
        sql: payload.sql,
        parameters: payload.parameters,
        explanation: payload.explanation,
        confidence: payload
            .confidence
            .unwrap_or(DEFAULT_LLM_CONFIDENCE)
            .clamp(0.0, 1.0),
        source: SqlSource::Llm,
    };

    if !artifact.placeholders_bound() {
        return Err(LlmError::Malformed(
            "placeholders do not match parameter keys".to_string(),
        ));
    }

    Ok(artifact)
}

/// Find the first balanced `{…}` block, respecting string literals, so a
/// model answer wrapped in prose or code fences can still be recovered.
fn extract_balanced_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
