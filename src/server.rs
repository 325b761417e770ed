//! HTTP + WebSocket transport for the search gateway.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search/natural-language` | One-shot natural-language search |
//! | `GET`  | `/search/stream` | WebSocket: progressive pipeline events |
//! | `GET`  | `/search/strategies` | Strategy catalogue |
//! | `GET`  | `/search/health` | Component health |
//! | `GET`  | `/search/cache/stats` | Cache hit/miss/entry counters |
//! | `POST` | `/search/cache/invalidate` | Drop cache entries by substring |
//! | `GET`  | `/search/analytics/popular` | Most-searched queries |
//! | `GET`  | `/search/analytics/failures` | High-failure-rate queries |
//! | `GET`  | `/search/analytics/stats` | Aggregate search statistics |
//!
//! # Error Contract
//!
//! Failures return `{"success": false, "error": {"kind", "message",
//! "request_id"}}` with the status mapped from the error kind:
//! `validation`/`security` → 400, `generation_failed` → 503, `timeout` →
//! 504, everything else → 500. Security rejections carry rule ids only —
//! the offending SQL is never echoed.
//!
//! # WebSocket protocol
//!
//! The client sends `{"type": "search_request", "query": …, "options"?: …,
//! "context"?: …}` and receives pipeline events as JSON, each carrying
//! `event_type`, `request_id` and a per-connection monotonic `seq`. A
//! `{"type": "ping"}` message gets a `pong` event. Client disconnects cancel
//! the in-flight request, including any LLM call behind it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::AnalyticsRecorder;
use crate::cache::ResultCache;
use crate::cancel::{CancelHandle, CancelToken};
use crate::error::SearchError;
use crate::models::{Intent, QueryRequest, SearchOptions, SearchResult, Strategy};
use crate::pipeline::{EventSink, SearchPipeline};
use crate::stream::{dispatch, DispatchOutcome, EventClient};

/// Maximum serialized context size accepted from clients.
const MAX_CONTEXT_BYTES: usize = 10 * 1024;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SearchPipeline>,
    pub cache: Arc<ResultCache>,
    pub analytics: Arc<AnalyticsRecorder>,
    /// Read pool kept for health pings; `None` in store-less test setups.
    pub read_pool: Option<PgPool>,
    pub default_strategy: Strategy,
    pub active_streams: Arc<AtomicUsize>,
}

/// Build the router; exposed separately from [`run_server`] for tests.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search/natural-language", post(handle_search))
        .route("/search/stream", get(handle_stream))
        .route("/search/strategies", get(handle_strategies))
        .route("/search/health", get(handle_health))
        .route("/search/cache/stats", get(handle_cache_stats))
        .route("/search/cache/invalidate", post(handle_cache_invalidate))
        .route("/search/analytics/popular", get(handle_popular))
        .route("/search/analytics/failures", get(handle_failures))
        .route("/search/analytics/stats", get(handle_analytics_stats))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is terminated.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    info!(bind, "search gateway listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error responses ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    request_id: String,
    /// Per-strategy reasons for `generation_failed`, rule ids for
    /// `security`. Omitted otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    reasons: Option<Vec<String>>,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    kind: String,
    message: String,
    request_id: String,
    reasons: Option<Vec<String>>,
}

impl AppError {
    fn from_search_error(err: &SearchError, request_id: &str) -> Self {
        let status = match err {
            SearchError::Validation(_) | SearchError::Security { .. } => StatusCode::BAD_REQUEST,
            SearchError::GenerationFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SearchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let reasons = match err {
            SearchError::GenerationFailed { reasons } => Some(reasons.clone()),
            SearchError::Security { rules } => {
                Some(rules.iter().map(|r| r.as_str().to_string()).collect())
            }
            _ => None,
        };
        Self {
            status,
            kind: err.kind().to_string(),
            message: err.client_message(),
            request_id: request_id.to_string(),
            reasons,
        }
    }

    fn validation(message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation".to_string(),
            message: message.into(),
            request_id: request_id.to_string(),
            reasons: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
                request_id: self.request_id,
                reasons: self.reasons,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

// ============ POST /search/natural-language ============

#[derive(Deserialize)]
struct SearchRequestBody {
    query: String,
    #[serde(default)]
    context: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    options: Option<SearchOptions>,
    #[serde(default)]
    user_id: Option<i64>,
}

#[derive(Serialize)]
struct ExecutionBody {
    sql_query: String,
    parameters: BTreeMap<String, serde_json::Value>,
    execution_time_ms: f64,
    rows_affected: i64,
    strategy_used: String,
}

#[derive(Serialize)]
struct SearchResponseBody {
    request_id: String,
    intent: Intent,
    execution: ExecutionBody,
    data: Vec<serde_json::Map<String, serde_json::Value>>,
    total_rows: i64,
    success: bool,
    timestamp: String,
}

fn success_body(request_id: &str, result: SearchResult) -> SearchResponseBody {
    SearchResponseBody {
        request_id: request_id.to_string(),
        execution: ExecutionBody {
            sql_query: result.sql.sql.clone(),
            parameters: result.sql.parameters.clone(),
            execution_time_ms: result.execution_time_ms,
            rows_affected: result.row_count,
            strategy_used: result.strategy_used.as_str().to_string(),
        },
        intent: result.intent.clone(),
        data: result.rows,
        total_rows: result.row_count,
        success: true,
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// Build the internal request from a wire body, applying the configured
/// default strategy when the client sent no options at all.
fn build_request(
    body: SearchRequestBody,
    default_strategy: Strategy,
    request_id: &str,
) -> Result<QueryRequest, AppError> {
    if body.query.trim().is_empty() {
        return Err(AppError::validation("query must not be empty", request_id));
    }

    let context = body.context.unwrap_or_default();
    let context_bytes = serde_json::to_string(&context).map(|s| s.len()).unwrap_or(0);
    if context_bytes > MAX_CONTEXT_BYTES {
        return Err(AppError::validation(
            format!("context too large ({} bytes)", context_bytes),
            request_id,
        ));
    }

    let options = body.options.unwrap_or_else(|| SearchOptions {
        strategy: default_strategy,
        ..SearchOptions::default()
    });

    if !(1..=100).contains(&options.limit) {
        return Err(AppError::validation("limit must be in 1..=100", request_id));
    }

    Ok(QueryRequest::new(&body.query, context, options, body.user_id))
}

async fn handle_search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequestBody>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<SearchResponseBody>, AppError> {
    let request_id = new_request_id();

    let Json(body) = body
        .map_err(|e| AppError::validation(format!("malformed request body: {}", e), &request_id))?;

    let request = build_request(body, state.default_strategy, &request_id)?;
    debug!(request_id = %request_id, query = %request.normalized_query, "search request");

    let result = state
        .pipeline
        .run(&request, &EventSink::detached(), &CancelToken::detached())
        .await
        .map_err(|e| AppError::from_search_error(&e, &request_id))?;

    Ok(Json(success_body(&request_id, result)))
}

// ============ GET /search/stream (WebSocket) ============

#[derive(Deserialize)]
struct StreamParams {
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    context: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    options: Option<SearchOptions>,
}

struct WsClient {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl EventClient for WsClient {
    async fn send(&mut self, event: serde_json::Value) -> anyhow::Result<()> {
        self.sink
            .send(Message::Text(event.to_string().into()))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send failed: {}", e))
    }
}

async fn handle_stream(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let client_id = params
        .client_id
        .unwrap_or_else(|| format!("client_{}", Uuid::new_v4().simple()));
    ws.on_upgrade(move |socket| stream_session(socket, state, client_id))
}

async fn stream_session(socket: WebSocket, state: AppState, client_id: String) {
    info!(client_id = %client_id, "stream client connected");
    state.active_streams.fetch_add(1, Ordering::Relaxed);

    let (sink, mut receiver) = socket.split();
    let mut client = WsClient { sink };

    let greeting = serde_json::json!({
        "event_type": "connection_established",
        "client_id": client_id,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if client.send(greeting).await.is_err() {
        state.active_streams.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };

        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        match parsed {
            Ok(msg) if msg.kind == "ping" => {
                let pong = serde_json::json!({
                    "event_type": "pong",
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if client.send(pong).await.is_err() {
                    break;
                }
            }
            Ok(msg) if msg.kind == "search_request" => {
                let done =
                    run_streaming_search(&state, &mut client, &mut receiver, msg).await;
                if !done {
                    break;
                }
            }
            Ok(msg) => {
                let err = serde_json::json!({
                    "event_type": "error",
                    "error": {"kind": "validation", "message": format!("unknown message type: {}", msg.kind)},
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if client.send(err).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let err = serde_json::json!({
                    "event_type": "error",
                    "error": {"kind": "validation", "message": format!("malformed message: {}", e)},
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if client.send(err).await.is_err() {
                    break;
                }
            }
        }
    }

    state.active_streams.fetch_sub(1, Ordering::Relaxed);
    info!(client_id = %client_id, "stream client disconnected");
}

/// Run one streamed search. Returns `false` when the connection is gone and
/// the session loop should end.
async fn run_streaming_search(
    state: &AppState,
    client: &mut WsClient,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    msg: ClientMessage,
) -> bool {
    let request_id = new_request_id();

    let query = msg.query.unwrap_or_default();
    let body = SearchRequestBody {
        query,
        context: msg.context,
        options: msg.options,
        user_id: None,
    };
    let request = match build_request(body, state.default_strategy, &request_id) {
        Ok(request) => request,
        Err(err) => {
            let notice = serde_json::json!({
                "event_type": "error",
                "request_id": request_id,
                "error": {"kind": err.kind, "message": err.message},
                "timestamp": Utc::now().to_rfc3339(),
            });
            return client.send(notice).await.is_ok();
        }
    };

    let (tx, rx) = broadcast::channel(256);
    let (cancel_handle, cancel_token) = CancelHandle::new();

    let pipeline = state.pipeline.clone();
    let sink = EventSink::new(tx);
    let pipeline_task = tokio::spawn(async move {
        // Terminal events reach the client through the bus; the result
        // itself is not needed here.
        let _ = pipeline.run(&request, &sink, &cancel_token).await;
    });

    let dispatch_fut = dispatch(rx, &request_id, client, &cancel_handle);
    tokio::pin!(dispatch_fut);

    let connected = loop {
        tokio::select! {
            outcome = &mut dispatch_fut => {
                match outcome {
                    DispatchOutcome::Completed => break true,
                    DispatchOutcome::Backpressure => {
                        warn!(request_id = %request_id, "stream closed under backpressure");
                        break false;
                    }
                    DispatchOutcome::Disconnected => break false,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Messages during a search are ignored; a close or error
                    // cancels the in-flight request.
                    Some(Ok(_)) => continue,
                    _ => {
                        cancel_handle.cancel();
                        break false;
                    }
                }
            }
        }
    };

    let _ = pipeline_task.await;
    connected
}

// ============ GET /search/strategies ============

async fn handle_strategies() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "strategies": {
            "llm_first": {
                "description": "LLM first, rule-based fallback on failure",
                "accuracy": "high", "speed": "medium", "cost": "medium",
            },
            "rule_first": {
                "description": "Rule-based first, LLM fallback on no match or low confidence",
                "accuracy": "medium", "speed": "fast", "cost": "low",
            },
            "hybrid": {
                "description": "Both in parallel, higher-confidence result wins",
                "accuracy": "highest", "speed": "slow", "cost": "high",
            },
            "llm_only": {
                "description": "LLM only, no fallback",
                "accuracy": "high", "speed": "medium", "cost": "medium",
            },
            "rule_only": {
                "description": "Rule-based only, no LLM",
                "accuracy": "low", "speed": "fastest", "cost": "none",
            },
        },
        "default": "llm_first",
        "total_count": 5,
    }))
}

// ============ GET /search/health ============

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match &state.read_pool {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "healthy".to_string(),
            Err(e) => format!("unhealthy: {}", e),
        },
        None => "not configured".to_string(),
    };

    let cache_stats = state.cache.stats().await;
    let degraded = database.starts_with("unhealthy");

    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "components": {
            "database": database,
            "cache": {"entries": cache_stats.entries, "hits": cache_stats.hits},
            "streams": {"active": state.active_streams.load(Ordering::Relaxed)},
        },
    }))
}

// ============ Cache admin ============

async fn handle_cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.cache.stats().await;
    Json(serde_json::to_value(stats).unwrap_or(serde_json::json!({})))
}

#[derive(Deserialize)]
struct InvalidateBody {
    pattern: String,
}

async fn handle_cache_invalidate(
    State(state): State<AppState>,
    body: Result<Json<InvalidateBody>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request_id = new_request_id();
    let Json(body) = body
        .map_err(|e| AppError::validation(format!("malformed request body: {}", e), &request_id))?;
    if body.pattern.trim().is_empty() {
        return Err(AppError::validation("pattern must not be empty", &request_id));
    }
    let removed = state.cache.invalidate(&body.pattern).await;
    Ok(Json(serde_json::json!({"removed": removed})))
}

// ============ Analytics read surface ============

#[derive(Deserialize)]
struct PopularParams {
    #[serde(default = "default_popular_limit")]
    limit: usize,
    #[serde(default = "default_window_days")]
    days: i64,
}

fn default_popular_limit() -> usize {
    10
}
fn default_window_days() -> i64 {
    7
}

async fn handle_popular(
    State(state): State<AppState>,
    Query(params): Query<PopularParams>,
) -> Json<serde_json::Value> {
    let rows = state
        .analytics
        .popular(params.limit, chrono::Duration::days(params.days.max(1)));
    Json(serde_json::json!({"popular": rows, "window_days": params.days}))
}

#[derive(Deserialize)]
struct FailureParams {
    #[serde(default = "default_min_rate")]
    min_rate: f64,
    #[serde(default = "default_popular_limit")]
    limit: usize,
}

fn default_min_rate() -> f64 {
    0.5
}

async fn handle_failures(
    State(state): State<AppState>,
    Query(params): Query<FailureParams>,
) -> Json<serde_json::Value> {
    let rows = state.analytics.failures(params.min_rate, params.limit);
    Json(serde_json::json!({"failures": rows, "min_rate": params.min_rate}))
}

async fn handle_analytics_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.analytics.stats();
    Json(serde_json::to_value(stats).unwrap_or(serde_json::json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_query_rejected() {
        let body = SearchRequestBody {
            query: "   ".to_string(),
            context: None,
            options: None,
            user_id: None,
        };
        let err = build_request(body, Strategy::LlmFirst, "req_t").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.kind, "validation");
    }

    #[test]
    fn oversized_context_rejected() {
        let mut context = BTreeMap::new();
        context.insert("blob".to_string(), serde_json::json!("x".repeat(20_000)));
        let body = SearchRequestBody {
            query: "고객 목록".to_string(),
            context: Some(context),
            options: None,
            user_id: None,
        };
        let err = build_request(body, Strategy::LlmFirst, "req_t").unwrap_err();
        assert_eq!(err.kind, "validation");
    }

    #[test]
    fn missing_options_use_default_strategy() {
        let body = SearchRequestBody {
            query: "고객 목록".to_string(),
            context: None,
            options: None,
            user_id: None,
        };
        let request = build_request(body, Strategy::RuleFirst, "req_t").unwrap();
        assert_eq!(request.options.strategy, Strategy::RuleFirst);
    }

    #[test]
    fn limit_out_of_band_rejected() {
        let body = SearchRequestBody {
            query: "고객 목록".to_string(),
            context: None,
            options: Some(SearchOptions {
                limit: 101,
                ..SearchOptions::default()
            }),
            user_id: None,
        };
        let err = build_request(body, Strategy::LlmFirst, "req_t").unwrap_err();
        assert_eq!(err.kind, "validation");
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (SearchError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                SearchError::Security { rules: vec![] },
                StatusCode::BAD_REQUEST,
            ),
            (
                SearchError::GenerationFailed { reasons: vec![] },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (SearchError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                SearchError::Runtime("db".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from_search_error(&err, "req_t").status, expected);
        }
    }

    #[test]
    fn generation_failure_body_carries_reason_array() {
        let err = SearchError::GenerationFailed {
            reasons: vec!["rule: no_rule_match".to_string(), "llm: llm_timeout".to_string()],
        };
        let app_err = AppError::from_search_error(&err, "req_t");
        assert_eq!(app_err.reasons.as_ref().map(Vec::len), Some(2));

        let security = SearchError::Security {
            rules: vec![crate::models::RuleId::Destructive],
        };
        let app_err = AppError::from_search_error(&security, "req_t");
        assert_eq!(
            app_err.reasons,
            Some(vec!["destructive".to_string()])
        );
    }
}
