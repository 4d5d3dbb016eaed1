pub mod review;
pub mod tls;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use hyper::body::Bytes;

use crate::annotations::parse_annotations;
use crate::config::SKIP_NAMESPACES;
use crate::mutate::{build_patch, MutationSettings};
use crate::shutdown::Shutdown;
use review::{AdmissionResponse, AdmissionReview};
use tls::ReloadableTls;

/// Reviews larger than this are rejected before JSON decoding.
pub const MAX_REVIEW_BYTES: usize = 3 * 1024 * 1024;

pub struct AdmissionState {
    pub settings: MutationSettings,
    pub timeout: Duration,
    pub cert_loaded: Arc<AtomicBool>,
    pub listener_bound: Arc<AtomicBool>,
}

pub fn admission_routes(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_pod))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(DefaultBodyLimit::max(MAX_REVIEW_BYTES))
        .layer(Extension(state))
}

async fn healthz(Extension(state): Extension<Arc<AdmissionState>>) -> StatusCode {
    if state.cert_loaded.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readyz(Extension(state): Extension<Arc<AdmissionState>>) -> StatusCode {
    if state.cert_loaded.load(Ordering::Relaxed) && state.listener_bound.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Inspects the pod and produces the patch plus any warnings. Every failure
/// mode inside degrades to "admit unchanged"; a rejected pod is strictly
/// worse than an un-injected one.
fn evaluate(
    request: &review::AdmissionRequest,
    settings: &MutationSettings,
) -> (Option<json_patch::Patch>, Vec<String>) {
    if let Some(namespace) = &request.namespace {
        if SKIP_NAMESPACES.iter().any(|ns| ns == namespace) {
            return (None, Vec::new());
        }
    }

    let pod = match request.decode_pod() {
        Ok(pod) => pod,
        Err(err) => {
            return (
                None,
                vec![format!("kubedb-monitor: object is not a pod: {err}")],
            )
        }
    };

    if pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("kubedb.monitor/skip"))
        .map(|v| v == "true")
        .unwrap_or(false)
    {
        return (None, Vec::new());
    }

    let parsed = match parse_annotations(pod.metadata.annotations.as_ref()) {
        Ok(parsed) => parsed,
        Err(err) => {
            return (
                None,
                vec![format!("kubedb-monitor: {err}; pod admitted without injection")],
            )
        }
    };

    match build_patch(&pod, &parsed.config, settings) {
        Ok(outcome) => {
            let is_empty = outcome.is_empty();
            let mut warnings = parsed.warnings;
            warnings.extend(outcome.warnings);
            let patch = (!is_empty).then_some(outcome.patch);
            (patch, warnings)
        }
        Err(err) => {
            let mut warnings = parsed.warnings;
            warnings.push(format!(
                "kubedb-monitor: patch build failed: {err}; pod admitted without injection"
            ));
            (None, warnings)
        }
    }
}

async fn mutate_pod(
    Extension(state): Extension<Arc<AdmissionState>>,
    body: Bytes,
) -> Response {
    let review: AdmissionReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("malformed admission review: {err}"),
            )
                .into_response()
        }
    };
    let Some(request) = review.request.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            "admission review carries no request".to_string(),
        )
            .into_response();
    };

    let uid = request.uid.clone();
    let settings = state.settings.clone();
    let work =
        tokio::task::spawn_blocking(move || evaluate(&request, &settings));

    let response = match tokio::time::timeout(state.timeout, work).await {
        Ok(Ok((Some(patch), warnings))) => {
            match AdmissionResponse::allow(&uid).with_patch(&patch) {
                Ok(response) => response.with_warnings(warnings),
                Err(err) => {
                    tracing::warn!(%err, %uid, "failed to encode patch; admitting unchanged");
                    AdmissionResponse::allow(&uid).with_warnings(vec![format!(
                        "kubedb-monitor: patch encoding failed: {err}"
                    )])
                }
            }
        }
        Ok(Ok((None, warnings))) => AdmissionResponse::allow(&uid).with_warnings(warnings),
        Ok(Err(join_err)) => {
            tracing::error!(?join_err, %uid, "mutation handler panicked");
            AdmissionResponse::allow(&uid).with_warnings(vec![
                "kubedb-monitor: internal error during mutation; pod admitted without injection"
                    .to_string(),
            ])
        }
        Err(_) => {
            tracing::warn!(%uid, "mutation exceeded deadline; admitting unchanged");
            AdmissionResponse::allow(&uid).with_warnings(vec![
                "kubedb-monitor: mutation timed out; pod admitted without injection".to_string(),
            ])
        }
    };

    Json(review.respond(response)).into_response()
}

/// TLS accept loop for the admission listener. Each connection picks up the
/// current serving config, so cert rotation applies to new handshakes
/// without a restart.
pub async fn serve(
    listener: tokio::net::TcpListener,
    tls: Arc<ReloadableTls>,
    app: Router,
    shutdown: Shutdown,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "admission accept error");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let acceptor = tls.acceptor();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(%err, %peer, "admission TLS handshake failed");
                    return;
                }
            };
            if let Err(err) = hyper::server::conn::Http::new()
                .serve_connection(stream, app)
                .await
            {
                tracing::debug!(%err, %peer, "admission connection error");
            }
        });
    }
    tracing::info!("admission listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state() -> Arc<AdmissionState> {
        Arc::new(AdmissionState {
            settings: MutationSettings {
                agent_image: "agent:latest".into(),
                jar_source_path: "/opt/kubedb/agent.jar".into(),
                mount_path: "/opt/kubedb/agent".into(),
                skip_image_markers: vec![],
            },
            timeout: Duration::from_secs(10),
            cert_loaded: Arc::new(AtomicBool::new(true)),
            listener_bound: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn post_review(body: Value) -> (StatusCode, Value) {
        let app = admission_routes(state());
        let response = app
            .oneshot(
                hyper::Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "application/json")
                    .body(hyper::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_400() {
        let app = admission_routes(state());
        let response = app
            .oneshot(
                hyper::Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .body(hyper::Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_on_mutate_is_rejected() {
        let app = admission_routes(state());
        let response = app
            .oneshot(
                hyper::Request::builder()
                    .method("GET")
                    .uri("/mutate")
                    .body(hyper::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn invalid_annotation_allows_with_warning() {
        let (status, doc) = post_review(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u-1",
                "namespace": "default",
                "object": {
                    "metadata": {
                        "name": "p",
                        "annotations": {
                            "kubedb.monitor/enable": "maybe"
                        }
                    },
                    "spec": {"containers": [{"name": "app"}]}
                }
            }
        }))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["response"]["allowed"], true);
        assert!(doc["response"].get("patch").is_none());
        assert!(doc["response"]["warnings"][0]
            .as_str()
            .unwrap()
            .contains("invalid annotation"));
    }

    #[tokio::test]
    async fn skip_namespace_is_admitted_unchanged() {
        let (status, doc) = post_review(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u-2",
                "namespace": "kube-system",
                "object": {
                    "metadata": {
                        "name": "p",
                        "annotations": {"kubedb.monitor/enable": "true"}
                    },
                    "spec": {"containers": [{"name": "app"}]}
                }
            }
        }))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["response"]["allowed"], true);
        assert!(doc["response"].get("patch").is_none());
    }
}
