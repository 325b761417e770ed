//! # NL Search Gateway CLI (`nlq`)
//!
//! The `nlq` binary starts the gateway and provides a few operational
//! commands against the same configuration.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nlq serve` | Start the HTTP + WebSocket gateway |
//! | `nlq check "<sql>"` | Run a statement through the safety validator |
//! | `nlq cache cleanup` | Delete expired cache entries |
//! | `nlq cache stats` | Show cache entry counts |
//! | `nlq popular` | Show the most-searched queries |
//!
//! ## Examples
//!
//! ```bash
//! nlq --config ./config/nlq.toml serve
//! nlq check "SELECT * FROM customers LIMIT 10"
//! nlq cache cleanup
//! nlq popular --limit 20
//! ```

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::Row;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nlsearch::analytics::AnalyticsRecorder;
use nlsearch::cache::{PgCacheStore, ResultCache};
use nlsearch::config::{load_config, Config};
use nlsearch::intent::IntentClassifier;
use nlsearch::llm::{LlmClient, OpenAiClient};
use nlsearch::models::Strategy;
use nlsearch::pipeline::{PipelineSettings, SearchPipeline};
use nlsearch::retry::RetryConfig;
use nlsearch::runner::PgQueryRunner;
use nlsearch::server::{run_server, AppState};
use nlsearch::strategy::StrategyScheduler;
use nlsearch::db;
use nlsearch::validator::SqlValidator;

#[derive(Parser)]
#[command(
    name = "nlq",
    about = "Natural-language search gateway over a read-only CRM replica",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nlq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP + WebSocket gateway.
    Serve,

    /// Run a SQL statement through the safety validator and print the
    /// verdict. Useful for tuning the whitelist.
    Check {
        /// The SQL statement to validate.
        sql: String,
    },

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show the most-searched queries from the persisted aggregates.
    Popular {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries.
    Cleanup,
    /// Show entry counts and approximate payload size.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Check { sql } => check(config, &sql),
        Commands::Cache { action } => cache_admin(config, action).await,
        Commands::Popular { limit } => popular(config, limit).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let read_pool = db::connect_read_only(&config).await?;
    let cache_pool = db::connect_cache(&config).await?;

    let cache = Arc::new(ResultCache::new(
        Arc::new(PgCacheStore::new(cache_pool.clone())),
        config.cache.ttl_secs,
    ));
    let analytics = AnalyticsRecorder::spawn(config.analytics.queue_size, Some(cache_pool));

    let llm_client: Option<Arc<dyn LlmClient>> = if config.llm.is_enabled() {
        let model = config.llm.model.as_deref().unwrap_or("gpt-4o-mini");
        Some(Arc::new(OpenAiClient::new(model)?))
    } else {
        info!("llm provider disabled, llm strategies fall back to rules");
        None
    };

    let scheduler = StrategyScheduler::new(
        llm_client,
        RetryConfig::default().with_max_attempts(config.llm.max_retries.max(1)),
        config.llm.timeout(),
    );

    let pipeline = Arc::new(SearchPipeline::new(
        IntentClassifier::new(None),
        scheduler,
        SqlValidator::new(config.pipeline.whitelist.iter().cloned()),
        cache.clone(),
        Arc::new(PgQueryRunner::new(read_pool.clone())),
        analytics.clone(),
        PipelineSettings {
            request_timeout: config.pipeline.request_timeout(),
            statement_timeout: Duration::from_secs(config.db.statement_timeout_secs),
        },
    ));

    // Periodic TTL sweep.
    let sweeper_cache = cache.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let removed = sweeper_cache.cleanup().await;
            if removed > 0 {
                info!(removed, "cache sweep removed expired entries");
            }
        }
    });

    let default_strategy =
        Strategy::parse(&config.pipeline.default_strategy).unwrap_or(Strategy::LlmFirst);

    let state = AppState {
        pipeline,
        cache,
        analytics,
        read_pool: Some(read_pool),
        default_strategy,
        active_streams: Arc::new(AtomicUsize::new(0)),
    };

    run_server(&config.server.bind, state).await
}

fn check(config: Config, sql: &str) -> Result<()> {
    let validator = SqlValidator::new(config.pipeline.whitelist.iter().cloned());
    let verdict = validator.validate(sql);

    if verdict.accepted {
        println!("accepted");
        println!("executable: {}", verdict.normalized_sql);
    } else {
        println!("rejected");
        for rule in &verdict.reasons {
            println!("  - {}", rule.as_str());
        }
    }
    Ok(())
}

async fn cache_admin(config: Config, action: CacheAction) -> Result<()> {
    let pool = db::connect_cache(&config).await?;
    let cache = ResultCache::new(Arc::new(PgCacheStore::new(pool)), config.cache.ttl_secs);

    match action {
        CacheAction::Cleanup => {
            let removed = cache.cleanup().await;
            println!("removed {} expired entries", removed);
        }
        CacheAction::Stats => {
            let stats = cache.stats().await;
            println!("entries:      {}", stats.entries);
            println!("approx bytes: {}", stats.approx_bytes);
        }
    }
    Ok(())
}

async fn popular(config: Config, limit: i64) -> Result<()> {
    let pool = db::connect_cache(&config).await?;

    let rows = sqlx::query(
        "SELECT normalized_query, count, last_seen, avg_response_time, success_rate \
         FROM popular_queries ORDER BY count DESC LIMIT $1",
    )
    .bind(limit.max(1))
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No recorded queries.");
        return Ok(());
    }

    println!(
        "{:<48} {:>8} {:>10} {:>9}",
        "QUERY", "COUNT", "AVG (s)", "SUCCESS"
    );
    println!("{}", "-".repeat(80));
    for row in rows {
        let query: String = row.get("normalized_query");
        let count: i64 = row.get("count");
        let avg: f64 = row.get("avg_response_time");
        let rate: f64 = row.get("success_rate");
        println!("{:<48} {:>8} {:>10.3} {:>8.0}%", query, count, avg, rate * 100.0);
    }
    Ok(())
}
