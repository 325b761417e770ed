//! Streaming dispatch: one request's event bus → one client.
//!
//! The dispatcher subscribes to the request's broadcast bus, stamps each
//! event with the request id and a monotonically increasing `seq`, and
//! forwards it through an [`EventClient`] (the WebSocket in production, a
//! buffer in tests). Two exit conditions besides normal completion:
//!
//! - **Backpressure** — the broadcast ring overwrote events the client had
//!   not consumed yet. The client gets a final `error(backpressure)` and the
//!   stream closes.
//! - **Disconnect** — a send fails. Cancellation is signalled upstream so
//!   the pipeline and any in-flight LLM call unwind.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cancel::CancelHandle;
use crate::models::PipelineEvent;

/// Sink half of one streaming connection.
#[async_trait]
pub trait EventClient: Send {
    async fn send(&mut self, event: serde_json::Value) -> anyhow::Result<()>;
}

/// How a dispatch loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A terminal event was forwarded, or the bus closed.
    Completed,
    /// The client stopped accepting events; upstream was canceled.
    Disconnected,
    /// The client lagged past the bus capacity.
    Backpressure,
}

/// Serialize one pipeline event in the wire shape.
pub fn event_to_json(event: &PipelineEvent, request_id: &str, seq: u64) -> serde_json::Value {
    let mut body = match event {
        PipelineEvent::Start => serde_json::json!({"event_type": "search_started"}),
        PipelineEvent::StageStart(stage) => {
            serde_json::json!({"event_type": "stage_start", "stage": stage.as_str()})
        }
        PipelineEvent::StageEnd { stage, duration_ms } => serde_json::json!({
            "event_type": "stage_end",
            "stage": stage.as_str(),
            "duration_ms": duration_ms,
        }),
        PipelineEvent::Token { content, stage } => serde_json::json!({
            "event_type": "token",
            "content": content,
            "stage": stage.as_str(),
        }),
        PipelineEvent::CacheHit => serde_json::json!({"event_type": "cache_hit"}),
        PipelineEvent::PipelineComplete(result) => serde_json::json!({
            "event_type": "pipeline_complete",
            "result": result,
        }),
        PipelineEvent::Error { kind, message } => serde_json::json!({
            "event_type": "error",
            "error": {"kind": kind, "message": message},
        }),
    };
    let obj = body.as_object_mut().expect("event body is an object");
    obj.insert("request_id".to_string(), serde_json::json!(request_id));
    obj.insert("seq".to_string(), serde_json::json!(seq));
    obj.insert(
        "timestamp".to_string(),
        serde_json::json!(Utc::now().to_rfc3339()),
    );
    body
}

/// Forward events until a terminal event, disconnect or backpressure.
/// `cancel` is tripped on disconnect so the pipeline stops doing work
/// nobody will see.
pub async fn dispatch<C: EventClient>(
    mut rx: broadcast::Receiver<PipelineEvent>,
    request_id: &str,
    client: &mut C,
    cancel: &CancelHandle,
) -> DispatchOutcome {
    let mut seq: u64 = 0;

    loop {
        match rx.recv().await {
            Ok(event) => {
                seq += 1;
                let terminal = matches!(
                    event,
                    PipelineEvent::PipelineComplete(_) | PipelineEvent::Error { .. }
                );
                if client.send(event_to_json(&event, request_id, seq)).await.is_err() {
                    debug!(request_id, "stream client went away, canceling upstream");
                    cancel.cancel();
                    return DispatchOutcome::Disconnected;
                }
                if terminal {
                    return DispatchOutcome::Completed;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                seq += 1;
                let notice = event_to_json(
                    &PipelineEvent::Error {
                        kind: "backpressure",
                        message: format!("client lagged, {} events dropped", skipped),
                    },
                    request_id,
                    seq,
                );
                let _ = client.send(notice).await;
                return DispatchOutcome::Backpressure;
            }
            Err(broadcast::error::RecvError::Closed) => return DispatchOutcome::Completed,
        }
    }
}
