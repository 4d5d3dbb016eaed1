pub mod graph;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::events::{ErrorKind, EventType, IngestedEvent, QueryStatus, SqlKind};
use crate::queue::BoundedQueue;
use crate::shutdown::Shutdown;
use graph::WaitForGraph;

pub const DEADLOCK_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);
pub const QUERY_SAMPLE_CAPACITY: usize = 16;

static FOR_UPDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfor\s+update\b").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    pod: String,
    connection: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxnPhase {
    Active,
    Committing,
    RolledBack,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionOutcome {
    Committed,
    RolledBack,
    ForcedByCollision,
    ForcedByStaleness,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySample {
    pub sql_pattern: Option<String>,
    pub execution_ms: u32,
    pub error: bool,
}

#[derive(Debug)]
pub struct TransactionState {
    pub transaction_id: String,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub last_activity: Instant,
    pub query_count: u64,
    pub samples: VecDeque<QuerySample>,
    pub held: BTreeSet<String>,
    pub waited: Option<String>,
    pub phase: TxnPhase,
    last_long_alert: Option<Instant>,
}

impl TransactionState {
    fn new(transaction_id: String, now: Instant, wall: DateTime<Utc>) -> Self {
        Self {
            transaction_id,
            started_at: now,
            started_wall: wall,
            last_activity: now,
            query_count: 0,
            samples: VecDeque::with_capacity(QUERY_SAMPLE_CAPACITY),
            held: BTreeSet::new(),
            waited: None,
            phase: TxnPhase::Active,
            last_long_alert: None,
        }
    }

    fn push_sample(&mut self, sample: QuerySample) {
        if self.samples.len() == QUERY_SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeadlockSource {
    Reported,
    Detected,
}

/// Events the tracker derives from the raw stream. These are what the
/// dashboard actually alerts on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum DerivedEvent {
    TransactionCompleted {
        pod_name: String,
        transaction_id: String,
        connection_id: String,
        outcome: CompletionOutcome,
        elapsed_ms: u64,
        query_count: u64,
    },
    DeadlockDetected {
        pod_name: String,
        participants: Vec<String>,
        resources: Vec<String>,
        source: DeadlockSource,
    },
    LongRunningTransaction {
        pod_name: String,
        transaction_id: String,
        connection_id: String,
        elapsed_ms: u64,
        query_count: u64,
        last_sample: Option<QuerySample>,
    },
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub long_tx_threshold: Duration,
    pub long_tx_alert_interval: Duration,
    pub stale_after: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            long_tx_threshold: Duration::from_secs(5),
            long_tx_alert_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Single-writer state machine over every live `(pod, connection)`. One
/// worker task owns an instance and drains the ingest queue; everyone else
/// sees immutable derived events.
pub struct TransactionTracker {
    live: HashMap<ConnKey, TransactionState>,
    graphs: HashMap<String, WaitForGraph>,
    reported_cycles: HashMap<String, HashSet<BTreeSet<String>>>,
    settings: TrackerSettings,
}

impl TransactionTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            live: HashMap::new(),
            graphs: HashMap::new(),
            reported_cycles: HashMap::new(),
            settings,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Elapsed times of transactions already flagged long-running; folded
    /// into the latency reservoir as synthetic observations for one tick.
    pub fn long_running_elapsed_ms(&self, now: Instant) -> Vec<u32> {
        self.live
            .values()
            .filter(|s| s.phase == TxnPhase::Active && s.last_long_alert.is_some())
            .map(|s| now.saturating_duration_since(s.started_at).as_millis() as u32)
            .collect()
    }

    pub fn handle(&mut self, ingested: &IngestedEvent) -> Vec<DerivedEvent> {
        let event = &ingested.event;
        let now = ingested.received_at;
        let mut derived = Vec::new();

        match event.event_type {
            EventType::TransactionBegin => {
                let Some((key, txn_id)) = self.txn_identity(ingested) else {
                    return derived;
                };
                if let Some(prior) = self.live.remove(&key) {
                    tracing::warn!(
                        pod = %key.pod,
                        connection = %key.connection,
                        prior = %prior.transaction_id,
                        next = %txn_id,
                        "transaction collision on live connection; forcing prior to completed"
                    );
                    derived.extend(self.finish(&key, prior, CompletionOutcome::ForcedByCollision, now));
                }
                let mut state = TransactionState::new(txn_id, now, ingested.received_wall);
                self.apply_lock_claims(&key.pod, &mut state, ingested);
                self.live.insert(key, state);
            }
            EventType::QueryExecution | EventType::QueryError => {
                derived.extend(self.handle_query(ingested, now));
            }
            EventType::TransactionCommit => {
                derived.extend(self.handle_terminal(ingested, CompletionOutcome::Committed, now));
            }
            EventType::TransactionRollback => {
                derived.extend(self.handle_terminal(ingested, CompletionOutcome::RolledBack, now));
            }
            EventType::Deadlock => {
                // Authoritative from the database; forwarded as-is.
                let txn = event.txn.as_ref();
                let participants = txn
                    .and_then(|t| t.participant_connection_ids.clone())
                    .or_else(|| txn.and_then(|t| t.transaction_id.clone()).map(|id| vec![id]))
                    .unwrap_or_default();
                let mut resources: BTreeSet<String> = BTreeSet::new();
                if let Some(t) = txn {
                    resources.extend(t.resources_held.clone().unwrap_or_default());
                    resources.extend(t.resources_waited.clone().unwrap_or_default());
                }
                derived.push(DerivedEvent::DeadlockDetected {
                    pod_name: event.pod_name.clone(),
                    participants,
                    resources: resources.into_iter().collect(),
                    source: DeadlockSource::Reported,
                });
            }
            EventType::LongRunningTransaction => {
                // Interceptor-side detection; forwarded next to our own.
                if let Some(txn) = &event.txn {
                    derived.push(DerivedEvent::LongRunningTransaction {
                        pod_name: event.pod_name.clone(),
                        transaction_id: txn.transaction_id.clone().unwrap_or_default(),
                        connection_id: txn.connection_id.clone().unwrap_or_default(),
                        elapsed_ms: txn.elapsed_ms.unwrap_or_default(),
                        query_count: 0,
                        last_sample: None,
                    });
                }
            }
            EventType::TpsEvent => {}
        }
        derived
    }

    fn txn_identity(&self, ingested: &IngestedEvent) -> Option<(ConnKey, String)> {
        let event = &ingested.event;
        let txn = event.txn.as_ref()?;
        let connection = txn.connection_id.clone()?;
        let txn_id = txn.transaction_id.clone()?;
        Some((
            ConnKey {
                pod: event.pod_name.clone(),
                connection,
            },
            txn_id,
        ))
    }

    fn connection_of(&self, ingested: &IngestedEvent) -> Option<String> {
        let event = &ingested.event;
        event
            .txn
            .as_ref()
            .and_then(|t| t.connection_id.clone())
            .or_else(|| event.query.as_ref().and_then(|q| q.connection_id.clone()))
    }

    fn handle_query(&mut self, ingested: &IngestedEvent, now: Instant) -> Vec<DerivedEvent> {
        let event = &ingested.event;
        let mut derived = Vec::new();
        let Some(connection) = self.connection_of(ingested) else {
            return derived;
        };
        let key = ConnKey {
            pod: event.pod_name.clone(),
            connection,
        };

        if !self.live.contains_key(&key) {
            // First query on a non-autocommit connection opens the
            // transaction implicitly.
            let Some(txn_id) = event.txn.as_ref().and_then(|t| t.transaction_id.clone()) else {
                return derived;
            };
            self.live.insert(
                key.clone(),
                TransactionState::new(txn_id, now, ingested.received_wall),
            );
        }

        let pod = key.pod.clone();
        let mut lock_error = false;
        {
            let state = self.live.get_mut(&key).expect("state just ensured");
            state.last_activity = now;
            state.query_count += 1;

            if let Some(query) = &event.query {
                state.push_sample(QuerySample {
                    sql_pattern: query.sql_pattern.clone(),
                    execution_ms: query.execution_ms.unwrap_or_default(),
                    error: query.status == Some(QueryStatus::Error)
                        || event.event_type == EventType::QueryError,
                });

                let is_locking = query.sql_kind.map(SqlKind::is_write).unwrap_or(false)
                    || query
                        .sql_pattern
                        .as_deref()
                        .map(|sql| FOR_UPDATE.is_match(sql))
                        .unwrap_or(false);
                if is_locking {
                    let graph = self.graphs.entry(pod.clone()).or_default();
                    for table in &query.tables {
                        state.held.insert(table.clone());
                        graph.add_hold(&state.transaction_id, table);
                        if state.waited.as_deref() == Some(table.as_str()) {
                            state.waited = None;
                        }
                    }
                }

                lock_error = event.event_type == EventType::QueryError
                    && matches!(
                        query.error_kind,
                        Some(ErrorKind::LockTimeout) | Some(ErrorKind::Deadlock)
                    );
            }
        }

        // Borrow of `live` dropped before touching the graph again.
        if let Some(state) = self.live.get_mut(&key) {
            let claims = lock_claims(ingested);
            if !claims.is_empty() {
                let graph = self.graphs.entry(pod.clone()).or_default();
                apply_claims(graph, state, claims);
            }
        }

        if lock_error {
            derived.extend(self.sweep_deadlocks());
        }
        derived
    }

    fn apply_lock_claims(&mut self, pod: &str, state: &mut TransactionState, ingested: &IngestedEvent) {
        let claims = lock_claims(ingested);
        if claims.is_empty() {
            return;
        }
        let graph = self.graphs.entry(pod.to_string()).or_default();
        apply_claims(graph, state, claims);
    }

    fn handle_terminal(
        &mut self,
        ingested: &IngestedEvent,
        outcome: CompletionOutcome,
        now: Instant,
    ) -> Vec<DerivedEvent> {
        let Some(connection) = self.connection_of(ingested) else {
            return Vec::new();
        };
        let key = ConnKey {
            pod: ingested.event.pod_name.clone(),
            connection,
        };
        match self.live.remove(&key) {
            Some(state) => self.finish(&key, state, outcome, now),
            None => {
                tracing::debug!(
                    pod = %key.pod,
                    connection = %key.connection,
                    "terminal event for unknown transaction"
                );
                Vec::new()
            }
        }
    }

    /// Emits the completion event and prunes every structure that referenced
    /// the transaction, re-arming deadlock reporting for its cycles. A
    /// terminal phase resolves cycles, so the graphs are re-scanned right
    /// away instead of waiting for the next periodic sweep.
    fn finish(
        &mut self,
        key: &ConnKey,
        mut state: TransactionState,
        outcome: CompletionOutcome,
        now: Instant,
    ) -> Vec<DerivedEvent> {
        state.phase = match outcome {
            CompletionOutcome::RolledBack => TxnPhase::RolledBack,
            _ => TxnPhase::Completed,
        };
        if let Some(graph) = self.graphs.get_mut(&key.pod) {
            graph.remove_txn(&state.transaction_id);
            if graph.is_empty() {
                self.graphs.remove(&key.pod);
            }
        }
        if let Some(signatures) = self.reported_cycles.get_mut(&key.pod) {
            signatures.retain(|sig| !sig.contains(&state.transaction_id));
            if signatures.is_empty() {
                self.reported_cycles.remove(&key.pod);
            }
        }
        let mut derived = vec![DerivedEvent::TransactionCompleted {
            pod_name: key.pod.clone(),
            transaction_id: state.transaction_id,
            connection_id: key.connection.clone(),
            outcome,
            elapsed_ms: now.saturating_duration_since(state.started_at).as_millis() as u64,
            query_count: state.query_count,
        }];
        derived.extend(self.sweep_deadlocks());
        derived
    }

    /// Cycle-find over every pod graph. A cycle is reported once and then
    /// silenced until one of its participants terminates.
    pub fn sweep_deadlocks(&mut self) -> Vec<DerivedEvent> {
        let mut derived = Vec::new();
        for (pod, graph) in &self.graphs {
            for cycle in graph.find_cycles() {
                let reported = self.reported_cycles.entry(pod.clone()).or_default();
                if reported.insert(cycle.signature()) {
                    derived.push(DerivedEvent::DeadlockDetected {
                        pod_name: pod.clone(),
                        participants: cycle.participants,
                        resources: cycle.resources.into_iter().collect(),
                        source: DeadlockSource::Detected,
                    });
                }
            }
        }
        derived
    }

    /// The 1 s maintenance pass: long-running alerts (at most one per
    /// transaction per alert interval) and staleness eviction.
    pub fn scan(&mut self, now: Instant) -> Vec<DerivedEvent> {
        let mut derived = Vec::new();
        let mut stale = Vec::new();

        for (key, state) in self.live.iter_mut() {
            if state.phase != TxnPhase::Active {
                continue;
            }
            if now.saturating_duration_since(state.last_activity) >= self.settings.stale_after {
                stale.push(key.clone());
                continue;
            }
            let elapsed = now.saturating_duration_since(state.started_at);
            if elapsed >= self.settings.long_tx_threshold {
                let due = match state.last_long_alert {
                    None => true,
                    Some(last) => {
                        now.saturating_duration_since(last) >= self.settings.long_tx_alert_interval
                    }
                };
                if due {
                    state.last_long_alert = Some(now);
                    derived.push(DerivedEvent::LongRunningTransaction {
                        pod_name: key.pod.clone(),
                        transaction_id: state.transaction_id.clone(),
                        connection_id: key.connection.clone(),
                        elapsed_ms: elapsed.as_millis() as u64,
                        query_count: state.query_count,
                        last_sample: state.samples.back().cloned(),
                    });
                }
            }
        }

        for key in stale {
            if let Some(state) = self.live.remove(&key) {
                tracing::warn!(
                    pod = %key.pod,
                    connection = %key.connection,
                    transaction = %state.transaction_id,
                    "transaction idle past staleness limit; forcing completed"
                );
                derived.extend(self.finish(&key, state, CompletionOutcome::ForcedByStaleness, now));
            }
        }
        derived
    }
}

fn lock_claims(ingested: &IngestedEvent) -> Vec<LockClaim> {
    let Some(txn) = &ingested.event.txn else {
        return Vec::new();
    };
    let mut claims = Vec::new();
    for resource in txn.resources_held.clone().unwrap_or_default() {
        claims.push(LockClaim::Held(resource));
    }
    for resource in txn.resources_waited.clone().unwrap_or_default() {
        claims.push(LockClaim::Waited(resource));
    }
    claims
}

enum LockClaim {
    Held(String),
    Waited(String),
}

fn apply_claims(graph: &mut WaitForGraph, state: &mut TransactionState, claims: Vec<LockClaim>) {
    for claim in claims {
        match claim {
            LockClaim::Held(resource) => {
                state.held.insert(resource.clone());
                if state.waited.as_deref() == Some(resource.as_str()) {
                    state.waited = None;
                }
                graph.add_hold(&state.transaction_id, &resource);
            }
            LockClaim::Waited(resource) => {
                state.waited = Some(resource.clone());
                graph.set_wait(&state.transaction_id, &resource);
            }
        }
    }
}

/// Messages flowing from the tracker worker to the aggregator.
#[derive(Debug)]
pub enum PipelineMessage {
    Event(IngestedEvent),
    Derived(DerivedEvent),
    TrackerTick {
        live_transactions: usize,
        long_running_elapsed_ms: Vec<u32>,
    },
}

/// Spawns the single-writer tracker worker. It drains the ingest queue,
/// forwards normalized events and derived alerts downstream, and runs the
/// periodic sweeps. The worker exits once the queue is closed and drained.
pub fn start_tracker(
    queue: Arc<BoundedQueue<IngestedEvent>>,
    settings: TrackerSettings,
    out: mpsc::Sender<PipelineMessage>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = TransactionTracker::new(settings);
        let mut sweep = interval(DEADLOCK_SWEEP_INTERVAL);
        let mut scan = interval(SCAN_INTERVAL);
        let mut draining = false;
        loop {
            tokio::select! {
                maybe = queue.pop() => {
                    let Some(ingested) = maybe else { break };
                    let derived = tracker.handle(&ingested);
                    if out.send(PipelineMessage::Event(ingested)).await.is_err() {
                        break;
                    }
                    if forward(&out, derived).await.is_err() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    if forward(&out, tracker.sweep_deadlocks()).await.is_err() {
                        break;
                    }
                }
                _ = scan.tick() => {
                    let now = Instant::now();
                    if forward(&out, tracker.scan(now)).await.is_err() {
                        break;
                    }
                    let tick = PipelineMessage::TrackerTick {
                        live_transactions: tracker.live_count(),
                        long_running_elapsed_ms: tracker.long_running_elapsed_ms(now),
                    };
                    if out.send(tick).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.wait(), if !draining => {
                    // Stop accepting; pending events drain via `pop`.
                    draining = true;
                    queue.close();
                }
            }
        }
        tracing::info!("transaction tracker stopped");
    })
}

async fn forward(
    out: &mpsc::Sender<PipelineMessage>,
    derived: Vec<DerivedEvent>,
) -> Result<(), mpsc::error::SendError<PipelineMessage>> {
    for event in derived {
        out.send(PipelineMessage::Derived(event)).await?;
    }
    Ok(())
}
