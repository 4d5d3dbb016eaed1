pub mod window;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::events::{EventType, IngestedEvent, QueryStatus, SystemBlock};
use crate::frames::FrameType;
use crate::hub::Hub;
use crate::ingest::IngestState;
use crate::tracker::{DerivedEvent, PipelineMessage};
use window::{Observation, RollingWindow, SubStats};

pub const BROADCAST_TICK: Duration = Duration::from_secs(1);

/// TPS documents are opaque pass-throughs; cap what one tick can carry.
const PASSTHROUGH_LIMIT: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub event_count: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
}

impl From<&SubStats> for PodStats {
    fn from(stats: &SubStats) -> Self {
        let avg = if stats.queries > 0 {
            stats.sum_exec_ms as f64 / stats.queries as f64
        } else {
            0.0
        };
        Self {
            event_count: stats.events,
            query_count: stats.queries,
            error_count: stats.errors,
            avg_latency_ms: avg,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlert {
    pub kind: &'static str,
    pub pod_name: String,
    pub raised_at: DateTime<Utc>,
    pub detail: Value,
}

/// Point-in-time aggregate view: the snapshot frame on connect, the REST
/// snapshot body, and the bulk of every delta frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub generated_at: DateTime<Utc>,
    pub window_seconds: u64,
    pub qps: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub p50_ms: u32,
    pub p95_ms: u32,
    pub p99_ms: u32,
    pub event_count: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub live_transactions: usize,
    pub ingest_dropped: u64,
    pub ingest_rejected: u64,
    pub per_pod: BTreeMap<String, PodStats>,
    pub per_node: BTreeMap<String, PodStats>,
    pub system: BTreeMap<String, SystemBlock>,
    pub active_alerts: Vec<ActiveAlert>,
}

impl AggregateSnapshot {
    pub fn empty(window_seconds: u64) -> Self {
        Self {
            generated_at: Utc::now(),
            window_seconds,
            qps: 0.0,
            avg_latency_ms: 0.0,
            error_rate: 0.0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            event_count: 0,
            query_count: 0,
            error_count: 0,
            live_transactions: 0,
            ingest_dropped: 0,
            ingest_rejected: 0,
            per_pod: BTreeMap::new(),
            per_node: BTreeMap::new(),
            system: BTreeMap::new(),
            active_alerts: Vec::new(),
        }
    }
}

/// Exclusive owner of the rolling window and the gauge/alert tables; lives
/// inside the aggregator worker.
pub struct Aggregator {
    window: RollingWindow,
    system: BTreeMap<String, SystemBlock>,
    live_transactions: usize,
    synthetic_ms: Vec<u32>,
    alerts: BTreeMap<String, ActiveAlert>,
    passthrough: Vec<Value>,
}

impl Aggregator {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window: RollingWindow::new(window_seconds),
            system: BTreeMap::new(),
            live_transactions: 0,
            synthetic_ms: Vec::new(),
            alerts: BTreeMap::new(),
            passthrough: Vec::new(),
        }
    }

    pub fn apply_event(&mut self, ingested: &IngestedEvent) {
        let event = &ingested.event;
        let is_query = matches!(
            event.event_type,
            EventType::QueryExecution | EventType::QueryError
        );
        let is_error = event.event_type == EventType::QueryError
            || event
                .query
                .as_ref()
                .map(|q| q.status == Some(QueryStatus::Error))
                .unwrap_or(false);
        let exec_ms = event.query.as_ref().and_then(|q| q.execution_ms);

        self.window.observe(
            ingested.received_wall.timestamp(),
            Observation {
                pod: &event.pod_name,
                node: event.node_name.as_deref(),
                is_query,
                is_error,
                exec_ms,
            },
        );

        if let Some(system) = &event.system {
            self.system.insert(event.pod_name.clone(), system.clone());
        }

        if event.event_type == EventType::TpsEvent && self.passthrough.len() < PASSTHROUGH_LIMIT {
            if let Ok(doc) = serde_json::to_value(event) {
                self.passthrough.push(doc);
            }
        }
    }

    pub fn apply_derived(&mut self, derived: &DerivedEvent) {
        match derived {
            DerivedEvent::LongRunningTransaction {
                pod_name,
                transaction_id,
                ..
            } => {
                let key = format!("long:{pod_name}:{transaction_id}");
                self.alerts.insert(
                    key,
                    ActiveAlert {
                        kind: "longRunningTransaction",
                        pod_name: pod_name.clone(),
                        raised_at: Utc::now(),
                        detail: serde_json::to_value(derived).unwrap_or(Value::Null),
                    },
                );
            }
            DerivedEvent::DeadlockDetected {
                pod_name,
                participants,
                ..
            } => {
                let mut sorted = participants.clone();
                sorted.sort();
                let key = format!("deadlock:{pod_name}:{}", sorted.join("+"));
                self.alerts.insert(
                    key,
                    ActiveAlert {
                        kind: "deadlock",
                        pod_name: pod_name.clone(),
                        raised_at: Utc::now(),
                        detail: serde_json::to_value(derived).unwrap_or(Value::Null),
                    },
                );
            }
            DerivedEvent::TransactionCompleted {
                pod_name,
                transaction_id,
                ..
            } => {
                let long_key = format!("long:{pod_name}:{transaction_id}");
                self.alerts.remove(&long_key);
                // A terminated participant resolves its deadlock alerts.
                let needle = transaction_id.clone();
                self.alerts.retain(|key, alert| {
                    !(alert.kind == "deadlock"
                        && alert.pod_name == *pod_name
                        && key
                            .rsplit(':')
                            .next()
                            .map(|ids| ids.split('+').any(|id| id == needle))
                            .unwrap_or(false))
                });
            }
        }
    }

    pub fn apply_tick(&mut self, live_transactions: usize, long_running_elapsed_ms: Vec<u32>) {
        self.live_transactions = live_transactions;
        self.synthetic_ms = long_running_elapsed_ms;
    }

    pub fn drain_passthrough(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.passthrough)
    }

    /// Recomputes the derived metrics. The synthetic in-flight observations
    /// count for this tick only.
    pub fn build_snapshot(
        &mut self,
        now: DateTime<Utc>,
        ingest_dropped: u64,
        ingest_rejected: u64,
    ) -> AggregateSnapshot {
        self.window.evict(now.timestamp());
        let totals = self.window.totals();
        let percentiles = self.window.percentiles(&self.synthetic_ms);
        self.synthetic_ms.clear();

        let window_seconds = self.window.window_seconds();
        let qps = totals.queries as f64 / window_seconds as f64;
        let avg_latency_ms = if totals.queries > 0 {
            totals.sum_exec_ms as f64 / totals.queries as f64
        } else {
            0.0
        };
        let error_rate = if totals.queries > 0 {
            totals.errors as f64 / totals.queries as f64
        } else {
            0.0
        };

        AggregateSnapshot {
            generated_at: now,
            window_seconds,
            qps,
            avg_latency_ms,
            error_rate,
            p50_ms: percentiles.p50,
            p95_ms: percentiles.p95,
            p99_ms: percentiles.p99,
            event_count: totals.events,
            query_count: totals.queries,
            error_count: totals.errors,
            live_transactions: self.live_transactions,
            ingest_dropped,
            ingest_rejected,
            per_pod: self
                .window
                .per_pod_totals()
                .iter()
                .map(|(pod, stats)| (pod.clone(), PodStats::from(stats)))
                .collect(),
            per_node: self
                .window
                .per_node_totals()
                .iter()
                .map(|(node, stats)| (node.clone(), PodStats::from(stats)))
                .collect(),
            system: self.system.clone(),
            active_alerts: self.alerts.values().cloned().collect(),
        }
    }
}

/// Spawns the aggregator worker: applies pipeline messages, and once per
/// tick publishes the refreshed snapshot over the watch channel and fans a
/// delta frame out through the hub. Exits when the tracker side hangs up.
pub fn start_aggregator(
    mut rx: mpsc::Receiver<PipelineMessage>,
    ingest: Arc<IngestState>,
    hub: Arc<Hub>,
    snapshot_tx: watch::Sender<Arc<AggregateSnapshot>>,
    window_seconds: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut aggregator = Aggregator::new(window_seconds);
        let mut tick = interval(BROADCAST_TICK);
        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(PipelineMessage::Event(ingested)) => {
                            aggregator.apply_event(&ingested);
                        }
                        Some(PipelineMessage::Derived(derived)) => {
                            aggregator.apply_derived(&derived);
                            match serde_json::to_value(&derived) {
                                Ok(payload) => hub.broadcast(FrameType::Alert, &payload),
                                Err(err) => {
                                    tracing::warn!(%err, "failed to encode derived event")
                                }
                            }
                        }
                        Some(PipelineMessage::TrackerTick {
                            live_transactions,
                            long_running_elapsed_ms,
                        }) => {
                            aggregator.apply_tick(live_transactions, long_running_elapsed_ms);
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    let snapshot = Arc::new(aggregator.build_snapshot(
                        Utc::now(),
                        ingest.dropped_total(),
                        ingest.rejected_total(),
                    ));
                    let mut payload = match serde_json::to_value(&*snapshot) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::error!(%err, "failed to encode snapshot");
                            continue;
                        }
                    };
                    let passthrough = aggregator.drain_passthrough();
                    if !passthrough.is_empty() {
                        payload["passthrough"] = Value::Array(passthrough);
                    }
                    hub.broadcast(FrameType::Delta, &payload);
                    let _ = snapshot_tx.send(snapshot);
                }
            }
        }
        tracing::info!("aggregator stopped");
    })
}
