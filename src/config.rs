use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Connection string for the read-only replica.
    pub read_url: String,
    /// Connection string for the cache/analytics tables. Defaults to
    /// `read_url` when omitted (single-database deployments).
    #[serde(default)]
    pub cache_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Hard per-request ceiling; request timeouts are clamped to this.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_strategy_name")]
    pub default_strategy: String,
    /// Base tables the validator accepts in FROM/JOIN position.
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai`. When disabled, llm-involving strategies
    /// degrade to the rule generator where the strategy allows it.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

fn default_pool_size() -> u32 {
    10
}
fn default_statement_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    60
}
fn default_strategy_name() -> String {
    "llm_first".to_string()
}
fn default_whitelist() -> Vec<String> {
    ["customers", "customer_memos", "customer_products", "users", "events"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_provider() -> String {
    "disabled".to_string()
}
fn default_llm_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_max_entries() -> usize {
    10_000
}
fn default_queue_size() -> usize {
    4096
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            default_strategy: default_strategy_name(),
            whitelist: default_whitelist(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            timeout_secs: default_llm_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.request_timeout_secs == 0 || config.pipeline.request_timeout_secs > 60 {
        anyhow::bail!("pipeline.request_timeout_secs must be in 1..=60");
    }

    if crate::models::Strategy::parse(&config.pipeline.default_strategy).is_none() {
        anyhow::bail!(
            "Unknown default strategy: '{}'. Must be llm_first, rule_first, hybrid, llm_only, or rule_only.",
            config.pipeline.default_strategy
        );
    }

    if config.pipeline.whitelist.is_empty() {
        anyhow::bail!("pipeline.whitelist must name at least one table");
    }

    if config.db.pool_size == 0 {
        anyhow::bail!("db.pool_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be disabled or openai.", other),
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    Ok(config)
}
