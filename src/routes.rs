use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;

use crate::aggregate::AggregateSnapshot;
use crate::hub::Hub;
use crate::ingest;

/// Liveness/readiness switches owned by the supervisor.
pub struct DashboardState {
    pub workers_started: Arc<AtomicBool>,
    pub draining: Arc<AtomicBool>,
}

/// Dashboard-listener routes. CORS is wide open here; the admission
/// endpoint lives on its own listener with cluster-only reachability.
pub fn api_routes(static_dir: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route(
            "/api/metrics",
            post(ingest::post_metrics)
                .layer(TimeoutLayer::new(std::time::Duration::from_secs(5))),
        )
        .route("/api/health", get(health))
        .route("/api/ready", get(ready))
        .route("/api/snapshot", get(snapshot))
        .route("/ws", get(live_updates))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(Extension(state): Extension<Arc<DashboardState>>) -> StatusCode {
    if state.workers_started.load(Ordering::Relaxed) && !state.draining.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// One-shot aggregate view for probes and socketless clients.
async fn snapshot(
    Extension(rx): Extension<watch::Receiver<Arc<AggregateSnapshot>>>,
) -> Json<AggregateSnapshot> {
    let snapshot = rx.borrow().as_ref().clone();
    Json(snapshot)
}

async fn live_updates(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<DashboardState>>,
    Extension(hub): Extension<Arc<Hub>>,
) -> Response {
    if state.draining.load(Ordering::Relaxed) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BoundedQueue;
    use crate::shutdown;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let (_handle, token) = shutdown::channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(AggregateSnapshot::empty(60)));
        // keep the sender alive for the router's lifetime
        std::mem::forget(snapshot_tx);
        let hub = Hub::new(256, snapshot_rx.clone(), token);
        let ingest_state = ingest::IngestState::new(Arc::new(BoundedQueue::new(64)));
        let state = Arc::new(DashboardState {
            workers_started: Arc::new(AtomicBool::new(true)),
            draining: Arc::new(AtomicBool::new(false)),
        });
        api_routes(None)
            .layer(Extension(state))
            .layer(Extension(hub))
            .layer(Extension(snapshot_rx))
            .layer(Extension(ingest_state))
    }

    #[tokio::test]
    async fn health_and_ready_answer() {
        let app = test_router();
        let health = app
            .clone()
            .oneshot(
                hyper::Request::get("/api/health")
                    .body(hyper::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = app
            .oneshot(
                hyper::Request::get("/api/ready")
                    .body(hyper::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn snapshot_returns_current_aggregates() {
        let app = test_router();
        let response = app
            .oneshot(
                hyper::Request::get("/api/snapshot")
                    .body(hyper::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["windowSeconds"], 60);
        assert_eq!(doc["queryCount"], 0);
    }
}
