use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, EnvFilter};

use kubedb_monitor::admission::{self, tls::ReloadableTls, AdmissionState};
use kubedb_monitor::aggregate::{start_aggregator, AggregateSnapshot};
use kubedb_monitor::config::Config;
use kubedb_monitor::hub::{Hub, FLUSH_GRACE};
use kubedb_monitor::ingest::IngestState;
use kubedb_monitor::mutate::MutationSettings;
use kubedb_monitor::queue::BoundedQueue;
use kubedb_monitor::routes::{api_routes, DashboardState};
use kubedb_monitor::shutdown;
use kubedb_monitor::tracker::{start_tracker, TrackerSettings};

const INGEST_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            return 1;
        }
    };

    // Serving cert first: without it there is no admission listener.
    let tls = match ReloadableTls::load(config.tls_cert_path.clone(), config.tls_key_path.clone())
    {
        Ok(tls) => tls,
        Err(err) => {
            tracing::error!(%err, "failed to load serving certificate");
            return 3;
        }
    };
    let cert_loaded = Arc::new(AtomicBool::new(true));
    let _cert_watcher = match admission::tls::spawn_cert_watcher(tls.clone()) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            tracing::warn!(%err, "certificate watcher unavailable; rotation needs a restart");
            None
        }
    };

    let admission_listener = match tokio::net::TcpListener::bind(config.admission_listen).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, addr = %config.admission_listen, "admission bind failed");
            return 2;
        }
    };
    let dashboard_listener = match std::net::TcpListener::bind(config.control_plane_listen) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, addr = %config.control_plane_listen, "dashboard bind failed");
            return 2;
        }
    };
    if let Err(err) = dashboard_listener.set_nonblocking(true) {
        tracing::error!(%err, "dashboard listener setup failed");
        return 2;
    }

    let (shutdown_handle, shutdown_token) = shutdown::channel();

    let ingest_queue = Arc::new(BoundedQueue::new(config.ingest_buffer_size));
    let ingest_state = IngestState::new(ingest_queue.clone());
    let (pipeline_tx, pipeline_rx) = mpsc::channel(4_096);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(AggregateSnapshot::empty(
        config.rolling_window_seconds,
    )));
    let hub = Hub::new(
        config.subscriber_queue_size,
        snapshot_rx.clone(),
        shutdown_token.clone(),
    );

    let tracker_settings = TrackerSettings {
        long_tx_threshold: config.long_tx_threshold,
        ..TrackerSettings::default()
    };
    let tracker_task = start_tracker(
        ingest_queue.clone(),
        tracker_settings,
        pipeline_tx,
        shutdown_token.clone(),
    );
    let aggregator_task = start_aggregator(
        pipeline_rx,
        ingest_state.clone(),
        hub.clone(),
        snapshot_tx,
        config.rolling_window_seconds,
    );

    let draining = Arc::new(AtomicBool::new(false));
    let dashboard_state = Arc::new(DashboardState {
        workers_started: Arc::new(AtomicBool::new(true)),
        draining: draining.clone(),
    });

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes(config.static_asset_dir.clone()))
        .layer(prometheus_layer)
        .layer(Extension(dashboard_state))
        .layer(Extension(hub.clone()))
        .layer(Extension(snapshot_rx.clone()))
        .layer(Extension(ingest_state.clone()));

    let admission_state = Arc::new(AdmissionState {
        settings: MutationSettings::from(&config),
        timeout: config.admission_timeout,
        cert_loaded: cert_loaded.clone(),
        listener_bound: Arc::new(AtomicBool::new(true)),
    });
    let admission_app = admission::admission_routes(admission_state);
    let admission_task = tokio::spawn(admission::serve(
        admission_listener,
        tls.clone(),
        admission_app,
        shutdown_token.clone(),
    ));

    let server = match axum::Server::from_tcp(dashboard_listener) {
        Ok(builder) => builder.serve(app.into_make_service()),
        Err(err) => {
            tracing::error!(%err, "dashboard server setup failed");
            return 2;
        }
    };
    let server_shutdown = shutdown_token.clone();
    let server_task = tokio::spawn(async move {
        let graceful =
            server.with_graceful_shutdown(async move { server_shutdown.wait().await });
        if let Err(err) = graceful.await {
            tracing::error!(%err, "dashboard server error");
        }
    });

    tracing::info!(
        dashboard = %config.control_plane_listen,
        admission = %config.admission_listen,
        window_seconds = config.rolling_window_seconds,
        "kubedb-monitor control plane started"
    );

    wait_for_signal().await;
    tracing::info!("shutdown signal received; draining");

    draining.store(true, Ordering::Relaxed);
    shutdown_handle.trigger();
    ingest_queue.close();

    if tokio::time::timeout(INGEST_DRAIN_TIMEOUT, tracker_task)
        .await
        .is_err()
    {
        tracing::warn!("ingest drain exceeded its budget; abandoning remaining events");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), aggregator_task).await;

    // Subscribers received the farewell frame; give them their flush window.
    tokio::time::sleep(FLUSH_GRACE + Duration::from_millis(250)).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission_task).await;

    tracing::info!("shutdown complete");
    0
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(%err, "SIGTERM handler unavailable; SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
