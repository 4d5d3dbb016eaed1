use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Upper bound for a single query execution; anything above is sender garbage.
pub const MAX_EXECUTION_MS: u32 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    QueryExecution,
    QueryError,
    TransactionBegin,
    TransactionCommit,
    TransactionRollback,
    TpsEvent,
    LongRunningTransaction,
    Deadlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl SqlKind {
    pub fn is_write(self) -> bool {
        matches!(self, SqlKind::Insert | SqlKind::Update | SqlKind::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    LockTimeout,
    Deadlock,
    Syntax,
    Connection,
    Timeout,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryBlock {
    pub query_id: Option<String>,
    pub sql_hash: Option<String>,
    pub sql_pattern: Option<String>,
    pub sql_kind: Option<SqlKind>,
    pub tables: Vec<String>,
    pub execution_ms: Option<u32>,
    pub rows_affected: Option<i64>,
    pub status: Option<QueryStatus>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub connection_id: Option<String>,
    pub thread_label: Option<String>,
    pub complexity_score: Option<f64>,
    pub cache_hit_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TxnBlock {
    pub transaction_id: Option<String>,
    pub connection_id: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub participant_connection_ids: Option<Vec<String>>,
    pub resources_held: Option<Vec<String>>,
    pub resources_waited: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemBlock {
    pub pool_active: Option<u32>,
    pub pool_idle: Option<u32>,
    pub pool_max: Option<u32>,
    pub heap_used_mb: Option<u64>,
    pub heap_max_mb: Option<u64>,
    pub cpu_ratio: Option<f64>,
    pub gc_count: Option<u64>,
    pub gc_ms: Option<u64>,
}

/// One wire document from an interceptor instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub event_type: EventType,
    #[serde(with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub pod_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub query: Option<QueryBlock>,
    #[serde(default)]
    pub txn: Option<TxnBlock>,
    #[serde(default)]
    pub system: Option<SystemBlock>,
}

/// Senders emit either epoch milliseconds or an RFC 3339 string.
mod wire_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_i64(ts.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = serde_json::Value::deserialize(de)?;
        match raw {
            serde_json::Value::Number(n) => {
                let millis = n
                    .as_i64()
                    .ok_or_else(|| DeError::custom("timestamp out of range"))?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| DeError::custom("timestamp out of range"))
            }
            serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| DeError::custom(format!("bad timestamp: {err}"))),
            _ => Err(DeError::custom("timestamp must be millis or RFC 3339")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricItemError {
    #[error("executionMs {0} exceeds the 24h ceiling")]
    ExecutionOutOfRange(u32),
    #[error("status=Error requires errorKind")]
    MissingErrorKind,
    #[error("pool gauges inconsistent: active {active} + idle {idle} > max {max}")]
    PoolGaugesInconsistent { active: u32, idle: u32, max: u32 },
    #[error("{0:?} event requires a txn block with connectionId")]
    MissingTxnConnection(EventType),
    #[error("transactionBegin requires txn.transactionId")]
    MissingTransactionId,
}

/// Item-level checks applied after the envelope has parsed. A failure skips
/// the one event and is reported back to the sender; it never fails the batch.
pub fn validate(event: &MetricEvent) -> Result<(), MetricItemError> {
    if let Some(query) = &event.query {
        if let Some(ms) = query.execution_ms {
            if ms > MAX_EXECUTION_MS {
                return Err(MetricItemError::ExecutionOutOfRange(ms));
            }
        }
        if query.status == Some(QueryStatus::Error) && query.error_kind.is_none() {
            return Err(MetricItemError::MissingErrorKind);
        }
    }
    if let Some(system) = &event.system {
        if let (Some(active), Some(idle), Some(max)) =
            (system.pool_active, system.pool_idle, system.pool_max)
        {
            if u64::from(active) + u64::from(idle) > u64::from(max) {
                return Err(MetricItemError::PoolGaugesInconsistent { active, idle, max });
            }
        }
    }
    match event.event_type {
        EventType::TransactionBegin => {
            let txn = event
                .txn
                .as_ref()
                .filter(|t| t.connection_id.is_some())
                .ok_or(MetricItemError::MissingTxnConnection(event.event_type))?;
            if txn.transaction_id.is_none() {
                return Err(MetricItemError::MissingTransactionId);
            }
        }
        EventType::TransactionCommit | EventType::TransactionRollback => {
            event
                .txn
                .as_ref()
                .filter(|t| t.connection_id.is_some())
                .ok_or(MetricItemError::MissingTxnConnection(event.event_type))?;
        }
        _ => {}
    }
    Ok(())
}

/// A validated event stamped with the receive clock. All SLO arithmetic uses
/// `received_at`; the sender timestamp is carried for display only.
#[derive(Debug, Clone)]
pub struct IngestedEvent {
    pub event: MetricEvent,
    pub received_at: Instant,
    pub received_wall: DateTime<Utc>,
}

impl IngestedEvent {
    pub fn new(event: MetricEvent) -> Self {
        Self {
            event,
            received_at: Instant::now(),
            received_wall: Utc::now(),
        }
    }

    /// Stamp with an explicit receive instant; tests drive the clock.
    pub fn at(event: MetricEvent, received_at: Instant) -> Self {
        Self {
            event,
            received_at,
            received_wall: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_event(kind: &str) -> serde_json::Value {
        json!({
            "eventType": kind,
            "timestamp": 1_700_000_000_000_i64,
            "podName": "orders-7c9f",
        })
    }

    #[test]
    fn parses_millis_and_rfc3339_timestamps() {
        let from_millis: MetricEvent =
            serde_json::from_value(base_event("queryExecution")).unwrap();
        assert_eq!(from_millis.timestamp.timestamp_millis(), 1_700_000_000_000);

        let mut doc = base_event("queryExecution");
        doc["timestamp"] = json!("2024-03-01T12:00:00.250Z");
        let from_string: MetricEvent = serde_json::from_value(doc).unwrap();
        assert_eq!(from_string.timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn error_status_requires_error_kind() {
        let mut doc = base_event("queryError");
        doc["query"] = json!({"status": "Error", "executionMs": 12});
        let event: MetricEvent = serde_json::from_value(doc).unwrap();
        assert_eq!(validate(&event), Err(MetricItemError::MissingErrorKind));
    }

    #[test]
    fn unknown_error_kind_degrades_to_other() {
        let mut doc = base_event("queryError");
        doc["query"] = json!({"status": "Error", "errorKind": "SomethingNew"});
        let event: MetricEvent = serde_json::from_value(doc).unwrap();
        assert_eq!(event.query.unwrap().error_kind, Some(ErrorKind::Other));
    }

    #[test]
    fn execution_time_ceiling_is_enforced() {
        let mut doc = base_event("queryExecution");
        doc["query"] = json!({"executionMs": MAX_EXECUTION_MS + 1});
        let event: MetricEvent = serde_json::from_value(doc).unwrap();
        assert!(matches!(
            validate(&event),
            Err(MetricItemError::ExecutionOutOfRange(_))
        ));
    }

    #[test]
    fn pool_gauges_must_fit_under_max() {
        let mut doc = base_event("tpsEvent");
        doc["system"] = json!({"poolActive": 8, "poolIdle": 4, "poolMax": 10});
        let event: MetricEvent = serde_json::from_value(doc).unwrap();
        assert!(matches!(
            validate(&event),
            Err(MetricItemError::PoolGaugesInconsistent { .. })
        ));
    }

    #[test]
    fn begin_requires_transaction_identity() {
        let mut doc = base_event("transactionBegin");
        doc["txn"] = json!({"connectionId": "c1"});
        let event: MetricEvent = serde_json::from_value(doc).unwrap();
        assert_eq!(validate(&event), Err(MetricItemError::MissingTransactionId));
    }
}
