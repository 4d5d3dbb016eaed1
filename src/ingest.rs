use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Extension, Json};
use hyper::body::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;
use crate::events::{validate, IngestedEvent, MetricEvent};
use crate::queue::BoundedQueue;

/// Shared between the ingest handler and everything that reports on it.
pub struct IngestState {
    pub queue: Arc<BoundedQueue<IngestedEvent>>,
    rejected: AtomicU64,
}

impl IngestState {
    pub fn new(queue: Arc<BoundedQueue<IngestedEvent>>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            rejected: AtomicU64::new(0),
        })
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.queue.dropped_total()
    }
}

#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Serialize)]
pub struct ItemError {
    pub index: usize,
    pub reason: String,
}

/// `POST /api/metrics`: accepts one event or an array. A bad item never
/// fails the batch; it is counted, reported in the body, and skipped. The
/// push never blocks: under overload the queue sheds its oldest entries so
/// the dashboard keeps seeing the most recent traffic.
pub async fn post_metrics(
    Extension(state): Extension<Arc<IngestState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    let envelope: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("malformed metric envelope: {err}")))?;

    let items: Vec<Value> = match envelope {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => {
            return Err(AppError::BadRequest(
                "metric envelope must be an object or an array".to_string(),
            ))
        }
    };

    let mut report = IngestReport {
        accepted: 0,
        rejected: 0,
        errors: Vec::new(),
    };

    for (index, item) in items.into_iter().enumerate() {
        let event: MetricEvent = match serde_json::from_value(item) {
            Ok(event) => event,
            Err(err) => {
                report.rejected += 1;
                report.errors.push(ItemError {
                    index,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if let Err(err) = validate(&event) {
            report.rejected += 1;
            report.errors.push(ItemError {
                index,
                reason: err.to_string(),
            });
            continue;
        }
        state.queue.push(IngestedEvent::new(event));
        report.accepted += 1;
    }

    if report.rejected > 0 {
        state
            .rejected
            .fetch_add(report.rejected as u64, Ordering::Relaxed);
        tracing::debug!(
            rejected = report.rejected,
            accepted = report.accepted,
            "metric batch contained bad items"
        );
    }

    Ok((StatusCode::ACCEPTED, Json(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> Arc<IngestState> {
        IngestState::new(Arc::new(BoundedQueue::new(64)))
    }

    fn event(pod: &str) -> Value {
        json!({
            "eventType": "queryExecution",
            "timestamp": 1_700_000_000_000_i64,
            "podName": pod,
            "query": {"executionMs": 5}
        })
    }

    #[tokio::test]
    async fn accepts_singleton_and_array() {
        let state = state();
        let (status, report) =
            post_metrics(Extension(state.clone()), Bytes::from(event("a").to_string()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(report.0.accepted, 1);

        let batch = json!([event("a"), event("b")]);
        let (status, report) =
            post_metrics(Extension(state.clone()), Bytes::from(batch.to_string()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(report.0.accepted, 2);
        assert_eq!(state.queue.len(), 3);
    }

    #[tokio::test]
    async fn bad_item_does_not_fail_the_batch() {
        let state = state();
        let batch = json!([event("a"), {"eventType": "queryExecution"}, event("b")]);
        let (status, report) =
            post_metrics(Extension(state.clone()), Bytes::from(batch.to_string()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(report.0.accepted, 2);
        assert_eq!(report.0.rejected, 1);
        assert_eq!(report.0.errors[0].index, 1);
        assert_eq!(state.rejected_total(), 1);
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_400() {
        let err = post_metrics(Extension(state()), Bytes::from_static(b"nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn scalar_envelope_is_a_400() {
        let err = post_metrics(Extension(state()), Bytes::from_static(b"42"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn overload_sheds_oldest_but_still_accepts() {
        let state = IngestState::new(Arc::new(BoundedQueue::new(2)));
        let batch = json!([event("a"), event("b"), event("c")]);
        let (status, report) =
            post_metrics(Extension(state.clone()), Bytes::from(batch.to_string()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(report.0.accepted, 3);
        assert_eq!(state.dropped_total(), 1);
        assert_eq!(state.queue.len(), 2);
    }
}
