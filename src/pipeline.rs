//! The query pipeline: stage sequencing, events, deadlines, cache flow.
//!
//! One [`SearchPipeline::run`] call drives a request through
//!
//! ```text
//! lookup_cache → classify_intent → generate_sql → validate_sql
//!             → execute_sql → format_result → store_cache → record_metrics
//! ```
//!
//! emitting [`PipelineEvent`]s on the request's broadcast bus as it goes.
//! A cache hit short-circuits after `lookup_cache`. The per-request deadline
//! bounds all stages cumulatively; the cancel token is checked at every
//! stage boundary and inside every suspension point. After cancellation the
//! cache is never written, though analytics may still record the outcome.
//!
//! Exactly one terminal event is emitted per request: `pipeline_complete`
//! on success, `error` otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::analytics::{AnalyticsRecorder, SearchRecord};
use crate::cache::{cache_key, ResultCache};
use crate::cancel::{CancelToken, Deadline};
use crate::error::SearchError;
use crate::format::{highlight_rows, paginate, summarize, HighlightOptions};
use crate::intent::IntentClassifier;
use crate::models::{
    PipelineEvent, QueryRequest, SearchResult, Stage, Verdict,
};
use crate::runner::QueryRunner;
use crate::strategy::{SchedulerError, StrategyScheduler};
use crate::validator::SqlValidator;

/// Timing knobs the pipeline applies to every request.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// System-wide per-request ceiling; request timeouts clamp to this.
    pub request_timeout: Duration,
    /// Per-statement database timeout, bounded by the remaining deadline.
    pub statement_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            statement_timeout: Duration::from_secs(10),
        }
    }
}

/// Fan-out handle for one request's event stream. Send failures mean no
/// subscriber is listening, which is fine for plain HTTP requests.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    /// A sink nobody listens to, for non-streaming callers.
    pub fn detached() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct SearchPipeline {
    classifier: IntentClassifier,
    scheduler: StrategyScheduler,
    validator: SqlValidator,
    cache: Arc<ResultCache>,
    runner: Arc<dyn QueryRunner>,
    analytics: Arc<AnalyticsRecorder>,
    settings: PipelineSettings,
    highlight: HighlightOptions,
}

impl SearchPipeline {
    pub fn new(
        classifier: IntentClassifier,
        scheduler: StrategyScheduler,
        validator: SqlValidator,
        cache: Arc<ResultCache>,
        runner: Arc<dyn QueryRunner>,
        analytics: Arc<AnalyticsRecorder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            classifier,
            scheduler,
            validator,
            cache,
            runner,
            analytics,
            settings,
            highlight: HighlightOptions::default(),
        }
    }

    /// Drive one request to completion, emitting events on `sink`.
    pub async fn run(
        &self,
        request: &QueryRequest,
        sink: &EventSink,
        cancel: &CancelToken,
    ) -> Result<SearchResult, SearchError> {
        let started = Instant::now();
        let requested = request
            .options
            .timeout_seconds
            .map(Duration::from_secs_f64)
            .unwrap_or(self.settings.request_timeout);
        let deadline = Deadline::after(requested.min(self.settings.request_timeout));

        sink.emit(PipelineEvent::Start);

        let outcome = self
            .run_stages(request, sink, cancel, deadline, started)
            .await;

        match &outcome {
            Ok(result) => {
                info!(
                    query = %request.normalized_query,
                    rows = result.row_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    strategy = result.strategy_used.as_str(),
                    "search completed"
                );
            }
            Err(err) => {
                sink.emit(PipelineEvent::Error {
                    kind: err.kind(),
                    message: err.client_message(),
                });
                self.record_outcome(request, started, 0, 0.0, 0.0, Some(err));
                warn!(
                    query = %request.normalized_query,
                    kind = err.kind(),
                    "search failed"
                );
            }
        }

        outcome
    }

    async fn run_stages(
        &self,
        request: &QueryRequest,
        sink: &EventSink,
        cancel: &CancelToken,
        deadline: Deadline,
        started: Instant,
    ) -> Result<SearchResult, SearchError> {
        let context_value =
            serde_json::to_value(&request.context).unwrap_or(serde_json::Value::Null);
        let key = cache_key(&request.normalized_query, &context_value, &request.options);

        // lookup_cache: on a miss the keyed guard is held across the whole
        // compute so concurrent identical requests wait here, then hit.
        let _compute_guard = if request.options.use_cache {
            let guard = tokio::select! {
                guard = self.cache.lock_key(&key) => guard,
                _ = cancel.canceled() => return Err(SearchError::Canceled),
                _ = tokio::time::sleep_until(deadline.instant()) => {
                    return Err(SearchError::Timeout)
                }
            };

            if let Some(payload) = self.cache.get(&key).await {
                if let Ok(result) = serde_json::from_value::<SearchResult>(payload) {
                    debug!(key = %key, "cache hit");
                    sink.emit(PipelineEvent::CacheHit);
                    sink.emit(PipelineEvent::PipelineComplete(Box::new(result.clone())));
                    return Ok(result);
                }
                // Undecodable payload: fall through and recompute.
                warn!(key = %key, "cached payload failed to decode, recomputing");
            }
            Some(guard)
        } else {
            None
        };

        self.checkpoint(cancel, deadline)?;

        // classify_intent — never fails.
        sink.emit(PipelineEvent::StageStart(Stage::Intent));
        let stage_start = Instant::now();
        let intent = self.classifier.classify(&request.normalized_query);
        sink.emit(PipelineEvent::StageEnd {
            stage: Stage::Intent,
            duration_ms: ms_since(stage_start),
        });

        self.checkpoint(cancel, deadline)?;

        // generate_sql
        sink.emit(PipelineEvent::StageStart(Stage::SqlGen));
        let stage_start = Instant::now();
        let artifact = self
            .scheduler
            .generate(
                request.options.strategy,
                &request.normalized_query,
                &intent,
                deadline,
                cancel,
            )
            .await
            .map_err(|e| match e {
                SchedulerError::Failed(reasons) => SearchError::GenerationFailed { reasons },
                SchedulerError::Timeout => SearchError::Timeout,
                SchedulerError::Canceled => SearchError::Canceled,
            })?;
        let sql_gen_ms = ms_since(stage_start);
        sink.emit(PipelineEvent::StageEnd {
            stage: Stage::SqlGen,
            duration_ms: sql_gen_ms,
        });

        self.checkpoint(cancel, deadline)?;

        // validate_sql — not subject to retry, and fast.
        sink.emit(PipelineEvent::StageStart(Stage::Validate));
        let stage_start = Instant::now();
        let verdict: Verdict = self.validator.validate(&artifact.sql);
        if !verdict.accepted {
            return Err(SearchError::Security {
                rules: verdict.reasons,
            });
        }
        sink.emit(PipelineEvent::StageEnd {
            stage: Stage::Validate,
            duration_ms: ms_since(stage_start),
        });

        self.checkpoint(cancel, deadline)?;

        // execute_sql
        sink.emit(PipelineEvent::StageStart(Stage::Execute));
        let stage_start = Instant::now();
        let row_cap = request.options.limit.clamp(1, self.validator.row_cap());
        let statement_window = deadline.bound(self.settings.statement_timeout);
        let rows = tokio::select! {
            rows = self.runner.execute(
                &verdict.normalized_sql,
                &artifact.parameters,
                row_cap,
                statement_window,
            ) => rows.map_err(|e| SearchError::Runtime(e.to_string()))?,
            _ = cancel.canceled() => return Err(SearchError::Canceled),
            _ = tokio::time::sleep_until(deadline.instant()) => {
                return Err(SearchError::Timeout)
            }
        };
        let sql_exec_ms = ms_since(stage_start);
        sink.emit(PipelineEvent::StageEnd {
            stage: Stage::Execute,
            duration_ms: sql_exec_ms,
        });

        self.checkpoint(cancel, deadline)?;

        // format_result
        sink.emit(PipelineEvent::StageStart(Stage::Format));
        let stage_start = Instant::now();
        let highlighted = request.options.enable_highlighting;
        let formatted_rows = if highlighted {
            highlight_rows(&rows, &request.raw_query, &self.highlight)
        } else {
            rows
        };
        let total = formatted_rows.len() as i64;
        let execution_time_ms = sql_gen_ms + sql_exec_ms;
        let result = SearchResult {
            row_count: total,
            page: paginate(total, 0, request.options.limit),
            summary: summarize(&formatted_rows, request.options.strategy, execution_time_ms),
            rows: formatted_rows,
            execution_time_ms,
            strategy_used: request.options.strategy,
            sql: artifact,
            intent,
            highlighted,
        };
        sink.emit(PipelineEvent::StageEnd {
            stage: Stage::Format,
            duration_ms: ms_since(stage_start),
        });

        // store_cache — skipped entirely after cancellation, and a failed
        // write is already degraded inside the cache service.
        if request.options.use_cache && !cancel.is_canceled() {
            if let Ok(payload) = serde_json::to_value(&result) {
                self.cache
                    .put(&key, &request.normalized_query, payload)
                    .await;
            }
        }

        // record_metrics — fire-and-forget into the analytics ring.
        self.record_outcome(request, started, result.row_count, sql_gen_ms, sql_exec_ms, None);

        sink.emit(PipelineEvent::PipelineComplete(Box::new(result.clone())));
        Ok(result)
    }

    /// Stage-boundary check for both cancellation signals.
    fn checkpoint(&self, cancel: &CancelToken, deadline: Deadline) -> Result<(), SearchError> {
        if cancel.is_canceled() {
            return Err(SearchError::Canceled);
        }
        if deadline.expired() {
            return Err(SearchError::Timeout);
        }
        Ok(())
    }

    fn record_outcome(
        &self,
        request: &QueryRequest,
        started: Instant,
        result_count: i64,
        sql_gen_ms: f64,
        sql_exec_ms: f64,
        error: Option<&SearchError>,
    ) {
        self.analytics.record(SearchRecord {
            timestamp: Utc::now(),
            user_id: request.user_id,
            normalized_query: request.normalized_query.clone(),
            strategy: request.options.strategy,
            success: error.is_none(),
            result_count,
            response_time_ms: ms_since(started),
            sql_gen_ms,
            sql_exec_ms,
            error_kind: error.map(|e| e.kind().to_string()),
        });
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::models::{SearchOptions, Strategy};
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runner returning canned rows, optionally after a delay.
    struct StaticRunner {
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl StaticRunner {
        fn with_rows(rows: Vec<serde_json::Map<String, serde_json::Value>>) -> Arc<Self> {
            Arc::new(Self {
                rows,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                rows: Vec::new(),
                delay,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl QueryRunner for StaticRunner {
        async fn execute(
            &self,
            _sql: &str,
            _parameters: &BTreeMap<String, serde_json::Value>,
            row_cap: i64,
            _timeout: Duration,
        ) -> anyhow::Result<Vec<serde_json::Map<String, serde_json::Value>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self
                .rows
                .iter()
                .take(row_cap.max(0) as usize)
                .cloned()
                .collect())
        }
    }

    fn sample_row(name: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut row = serde_json::Map::new();
        row.insert("name".to_string(), serde_json::json!(name));
        row.insert("customer_id".to_string(), serde_json::json!(1));
        row
    }

    fn pipeline_with(runner: Arc<dyn QueryRunner>) -> SearchPipeline {
        let whitelist = ["customers", "customer_memos", "customer_products", "users", "events"];
        SearchPipeline::new(
            IntentClassifier::new(None),
            StrategyScheduler::new(None, RetryConfig::default(), Duration::from_secs(5)),
            SqlValidator::new(whitelist),
            Arc::new(ResultCache::new(Arc::new(MemoryCacheStore::new(100)), 300)),
            runner,
            AnalyticsRecorder::spawn(64, None),
            PipelineSettings::default(),
        )
    }

    fn rule_request(query: &str) -> QueryRequest {
        QueryRequest::new(
            query,
            BTreeMap::new(),
            SearchOptions {
                strategy: Strategy::RuleOnly,
                ..SearchOptions::default()
            },
            None,
        )
    }

    fn collect_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn happy_path_emits_ordered_events() {
        let pipeline = pipeline_with(StaticRunner::with_rows(vec![sample_row("홍길동")]));
        let (tx, mut rx) = broadcast::channel(64);
        let sink = EventSink::new(tx);

        let result = pipeline
            .run(&rule_request("customers named 홍길동"), &sink, &CancelToken::detached())
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.highlighted);

        let events = collect_events(&mut rx);
        let labels: Vec<String> = events
            .iter()
            .map(|e| match e {
                PipelineEvent::Start => "start".to_string(),
                PipelineEvent::StageStart(s) => format!("start:{}", s.as_str()),
                PipelineEvent::StageEnd { stage, .. } => format!("end:{}", stage.as_str()),
                PipelineEvent::Token { .. } => "token".to_string(),
                PipelineEvent::CacheHit => "cache_hit".to_string(),
                PipelineEvent::PipelineComplete(_) => "complete".to_string(),
                PipelineEvent::Error { .. } => "error".to_string(),
            })
            .collect();
        assert_eq!(
            labels,
            vec![
                "start",
                "start:intent",
                "end:intent",
                "start:sql_gen",
                "end:sql_gen",
                "start:validate",
                "end:validate",
                "start:execute",
                "end:execute",
                "start:format",
                "end:format",
                "complete",
            ]
        );
    }

    #[tokio::test]
    async fn second_run_hits_cache() {
        let runner = StaticRunner::with_rows(vec![sample_row("홍길동")]);
        let pipeline = pipeline_with(runner.clone());
        let request = rule_request("customers named 홍길동");

        pipeline
            .run(&request, &EventSink::detached(), &CancelToken::detached())
            .await
            .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let (tx, mut rx) = broadcast::channel(64);
        pipeline
            .run(&request, &EventSink::new(tx), &CancelToken::detached())
            .await
            .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1, "second run must not execute SQL");

        let events = collect_events(&mut rx);
        assert!(matches!(events[1], PipelineEvent::CacheHit));
        assert!(matches!(events[2], PipelineEvent::PipelineComplete(_)));
    }

    #[tokio::test]
    async fn whitespace_and_case_variants_share_one_entry() {
        let runner = StaticRunner::with_rows(vec![sample_row("홍길동")]);
        let pipeline = pipeline_with(runner.clone());

        pipeline
            .run(
                &rule_request("Customers   Named 홍길동"),
                &EventSink::detached(),
                &CancelToken::detached(),
            )
            .await
            .unwrap();
        pipeline
            .run(
                &rule_request("customers named 홍길동 "),
                &EventSink::detached(),
                &CancelToken::detached(),
            )
            .await
            .unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn canceled_request_never_writes_cache() {
        let runner = StaticRunner::with_rows(vec![sample_row("홍길동")]);
        let pipeline = pipeline_with(runner.clone());
        let (handle, token) = crate::cancel::CancelHandle::new();
        handle.cancel();

        let err = pipeline
            .run(&rule_request("customers named 홍길동"), &EventSink::detached(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Canceled));

        // A fresh, uncanceled run must recompute — nothing was cached.
        pipeline
            .run(
                &rule_request("customers named 홍길동"),
                &EventSink::detached(),
                &CancelToken::detached(),
            )
            .await
            .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_execution_times_out() {
        let pipeline = pipeline_with(StaticRunner::slow(Duration::from_secs(120)));
        let mut request = rule_request("customers named 홍길동");
        request.options.timeout_seconds = Some(2.0);
        request.options.use_cache = false;

        let (tx, mut rx) = broadcast::channel(64);
        let err = pipeline
            .run(&request, &EventSink::new(tx), &CancelToken::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Timeout));

        let events = collect_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::StageStart(Stage::Execute))));
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Error { kind: "timeout", .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::PipelineComplete(_))));
    }

    #[tokio::test]
    async fn zero_rows_still_succeed() {
        let pipeline = pipeline_with(StaticRunner::with_rows(Vec::new()));
        let result = pipeline
            .run(
                &rule_request("customers named 홍길동"),
                &EventSink::detached(),
                &CancelToken::detached(),
            )
            .await
            .unwrap();
        assert_eq!(result.row_count, 0);
        assert!(result.rows.is_empty());
        assert_eq!(result.page.total, 0);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_compute_once() {
        let runner = StaticRunner::with_rows(vec![sample_row("홍길동")]);
        let pipeline = Arc::new(pipeline_with(runner.clone()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                pipeline
                    .run(
                        &rule_request("customers named 홍길동"),
                        &EventSink::detached(),
                        &CancelToken::detached(),
                    )
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }
}
