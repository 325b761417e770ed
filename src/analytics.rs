//! Asynchronous search analytics.
//!
//! Requests hand one [`SearchRecord`] to the recorder and move on — the
//! enqueue is a sub-millisecond mutex push into a bounded ring. A background
//! worker drains the ring and maintains:
//!
//! - per-query counters (count, last seen, EWMA response time with α = 0.1,
//!   success rate), also upserted into the `popular_queries` table when a
//!   pool is attached;
//! - per-error-kind counters;
//! - a response-time histogram for quantile estimates.
//!
//! When the ring is full the oldest record is dropped and a drop counter
//! incremented; analytics never block or fail a request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::{PopularQuery, Strategy};

/// EWMA smoothing factor for response times and success rates.
const EWMA_ALPHA: f64 = 0.1;

/// Histogram bucket upper bounds in milliseconds; the last bucket is open.
const BUCKET_BOUNDS_MS: [f64; 8] = [50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

/// One per-request measurement.
#[derive(Debug, Clone)]
pub struct SearchRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub normalized_query: String,
    pub strategy: Strategy,
    pub success: bool,
    pub result_count: i64,
    pub response_time_ms: f64,
    pub sql_gen_ms: f64,
    pub sql_exec_ms: f64,
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailurePattern {
    pub normalized_query: String,
    pub failure_rate: f64,
    pub attempts: u64,
    pub last_error_kind: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub total_searches: u64,
    pub successful_searches: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub dropped_records: u64,
    pub error_counts: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct QueryStat {
    count: u64,
    successes: u64,
    last_seen: DateTime<Utc>,
    ewma_response_secs: f64,
    last_error_kind: Option<String>,
}

#[derive(Default)]
struct Aggregates {
    queries: HashMap<String, QueryStat>,
    error_counts: HashMap<String, u64>,
    histogram: [u64; BUCKET_BOUNDS_MS.len() + 1],
    total: u64,
    successes: u64,
    response_time_sum_ms: f64,
}

struct Inner {
    ring: Mutex<VecDeque<SearchRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    enqueued: AtomicU64,
    processed: AtomicU64,
    notify: Notify,
    shutdown: AtomicBool,
    aggregates: Mutex<Aggregates>,
    pool: Option<PgPool>,
}

/// Handle used by the pipeline and the read endpoints.
pub struct AnalyticsRecorder {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AnalyticsRecorder {
    /// Spawn the recorder and its drain worker. `pool` enables
    /// `popular_queries` persistence; `None` keeps aggregates in memory only.
    pub fn spawn(capacity: usize, pool: Option<PgPool>) -> Arc<Self> {
        let inner = Arc::new(Inner {
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            aggregates: Mutex::new(Aggregates::default()),
            pool,
        });

        let worker_inner = inner.clone();
        let worker = tokio::spawn(async move {
            drain_loop(worker_inner).await;
        });

        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue one record. Never blocks beyond the ring mutex; a full ring
    /// drops its oldest record.
    pub fn record(&self, record: SearchRecord) {
        {
            let mut ring = self.inner.ring.lock().unwrap();
            if ring.len() >= self.inner.capacity {
                ring.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                // The dropped record still counts as handled.
                self.inner.processed.fetch_add(1, Ordering::Relaxed);
            }
            ring.push_back(record);
        }
        self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }

    /// Stop the worker after draining what is already queued.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Most-searched queries within `window`, ordered by count.
    pub fn popular(&self, limit: usize, window: ChronoDuration) -> Vec<PopularQuery> {
        let cutoff = Utc::now() - window;
        let aggregates = self.inner.aggregates.lock().unwrap();
        let mut rows: Vec<PopularQuery> = aggregates
            .queries
            .iter()
            .filter(|(_, stat)| stat.last_seen > cutoff)
            .map(|(query, stat)| PopularQuery {
                normalized_query: query.clone(),
                count: stat.count,
                last_seen: stat.last_seen,
                avg_response_time: stat.ewma_response_secs,
                success_rate: stat.successes as f64 / stat.count.max(1) as f64,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.normalized_query.cmp(&b.normalized_query)));
        rows.truncate(limit);
        rows
    }

    /// Queries failing at or above `min_rate`, worst first.
    pub fn failures(&self, min_rate: f64, limit: usize) -> Vec<FailurePattern> {
        let aggregates = self.inner.aggregates.lock().unwrap();
        let mut rows: Vec<FailurePattern> = aggregates
            .queries
            .iter()
            .filter_map(|(query, stat)| {
                let rate = 1.0 - stat.successes as f64 / stat.count.max(1) as f64;
                (rate >= min_rate && stat.count > stat.successes).then(|| FailurePattern {
                    normalized_query: query.clone(),
                    failure_rate: rate,
                    attempts: stat.count,
                    last_error_kind: stat.last_error_kind.clone(),
                    last_seen: stat.last_seen,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.failure_rate
                .partial_cmp(&a.failure_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.attempts.cmp(&a.attempts))
        });
        rows.truncate(limit);
        rows
    }

    pub fn stats(&self) -> AnalyticsSnapshot {
        let aggregates = self.inner.aggregates.lock().unwrap();
        let total = aggregates.total;
        AnalyticsSnapshot {
            total_searches: total,
            successful_searches: aggregates.successes,
            success_rate: if total > 0 {
                aggregates.successes as f64 / total as f64
            } else {
                0.0
            },
            avg_response_time_ms: if total > 0 {
                aggregates.response_time_sum_ms / total as f64
            } else {
                0.0
            },
            p50_response_time_ms: quantile(&aggregates.histogram, 0.50),
            p95_response_time_ms: quantile(&aggregates.histogram, 0.95),
            dropped_records: self.inner.dropped.load(Ordering::Relaxed),
            error_counts: aggregates.error_counts.clone(),
        }
    }

    /// Wait until everything enqueued so far has been folded into the
    /// aggregates. Test and shutdown helper.
    pub async fn flush(&self) {
        let target = self.inner.enqueued.load(Ordering::SeqCst);
        loop {
            if self.inner.processed.load(Ordering::SeqCst) >= target {
                return;
            }
            self.inner.notify.notify_one();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

async fn drain_loop(inner: Arc<Inner>) {
    loop {
        let batch: Vec<SearchRecord> = {
            let mut ring = inner.ring.lock().unwrap();
            ring.drain(..).collect()
        };

        if batch.is_empty() {
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            inner.notify.notified().await;
            continue;
        }

        {
            let mut aggregates = inner.aggregates.lock().unwrap();
            for record in &batch {
                fold(&mut aggregates, record);
            }
        }
        inner.processed.fetch_add(batch.len() as u64, Ordering::SeqCst);

        if let Some(pool) = inner.pool.as_ref() {
            for record in &batch {
                if let Err(e) = persist_popular(pool, record).await {
                    warn!(error = %e, "popular_queries upsert failed, keeping in-memory aggregates");
                    break;
                }
            }
        }
    }
}

fn fold(aggregates: &mut Aggregates, record: &SearchRecord) {
    aggregates.total += 1;
    if record.success {
        aggregates.successes += 1;
    }
    aggregates.response_time_sum_ms += record.response_time_ms;

    let bucket = BUCKET_BOUNDS_MS
        .iter()
        .position(|bound| record.response_time_ms <= *bound)
        .unwrap_or(BUCKET_BOUNDS_MS.len());
    aggregates.histogram[bucket] += 1;

    if let Some(kind) = &record.error_kind {
        *aggregates.error_counts.entry(kind.clone()).or_insert(0) += 1;
    }

    let response_secs = record.response_time_ms / 1000.0;
    aggregates
        .queries
        .entry(record.normalized_query.clone())
        .and_modify(|stat| {
            stat.count += 1;
            if record.success {
                stat.successes += 1;
            }
            stat.last_seen = record.timestamp;
            stat.ewma_response_secs =
                EWMA_ALPHA * response_secs + (1.0 - EWMA_ALPHA) * stat.ewma_response_secs;
            if record.error_kind.is_some() {
                stat.last_error_kind = record.error_kind.clone();
            }
        })
        .or_insert_with(|| QueryStat {
            count: 1,
            successes: if record.success { 1 } else { 0 },
            last_seen: record.timestamp,
            ewma_response_secs: response_secs,
            last_error_kind: record.error_kind.clone(),
        });
}

async fn persist_popular(pool: &PgPool, record: &SearchRecord) -> anyhow::Result<()> {
    let response_secs = record.response_time_ms / 1000.0;
    let success = if record.success { 1.0 } else { 0.0 };
    sqlx::query(
        "INSERT INTO popular_queries (normalized_query, count, last_seen, avg_response_time, success_rate) \
         VALUES ($1, 1, $2, $3, $4) \
         ON CONFLICT (normalized_query) DO UPDATE SET \
           count = popular_queries.count + 1, \
           last_seen = EXCLUDED.last_seen, \
           avg_response_time = popular_queries.avg_response_time * 0.9 + EXCLUDED.avg_response_time * 0.1, \
           success_rate = popular_queries.success_rate * 0.9 + EXCLUDED.success_rate * 0.1",
    )
    .bind(&record.normalized_query)
    .bind(record.timestamp)
    .bind(response_secs)
    .bind(success)
    .execute(pool)
    .await?;
    Ok(())
}

/// Estimate a quantile from the histogram: the upper bound of the first
/// bucket whose cumulative count reaches `q` of the total.
fn quantile(histogram: &[u64], q: f64) -> f64 {
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let target = (q * total as f64).ceil() as u64;
    let mut cumulative = 0u64;
    for (i, count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_BOUNDS_MS
                .get(i)
                .copied()
                .unwrap_or(BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1] * 2.0);
        }
    }
    BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1] * 2.0
}
