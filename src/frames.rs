use serde::Serialize;
use serde_json::Value;

/// Wire frame types pushed to dashboard subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameType {
    Snapshot,
    Delta,
    Alert,
    ResyncRecommended,
    Pong,
}

/// One WebSocket frame. `sequence` is monotone per subscriber; a gap tells
/// the client frames were shed and a fresh snapshot is in order.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub sequence: u64,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_serializes_with_wire_names() {
        let frame = Frame {
            frame_type: FrameType::ResyncRecommended,
            sequence: 7,
            payload: json!({"reason": "backpressure"}),
        };
        let doc = serde_json::to_value(&frame).unwrap();
        assert_eq!(doc["type"], "resyncRecommended");
        assert_eq!(doc["sequence"], 7);
        assert_eq!(doc["payload"]["reason"], "backpressure");
    }
}
