use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant};

use crate::aggregate::AggregateSnapshot;
use crate::frames::{Frame, FrameType};
use crate::queue::{BoundedQueue, PushOutcome};
use crate::shutdown::Shutdown;

pub const PING_INTERVAL: Duration = Duration::from_secs(15);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);
pub const FLUSH_GRACE: Duration = Duration::from_secs(2);

struct SubscriberHandle {
    queue: BoundedQueue<Frame>,
    sequence: AtomicU64,
    lost_frames: AtomicBool,
}

impl SubscriberHandle {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: BoundedQueue::new(capacity),
            sequence: AtomicU64::new(0),
            lost_frames: AtomicBool::new(false),
        })
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn enqueue(&self, frame_type: FrameType, payload: Value) {
        let frame = Frame {
            frame_type,
            sequence: self.next_sequence(),
            payload,
        };
        if self.queue.push(frame) == PushOutcome::Evicted {
            self.lost_frames.store(true, Ordering::Relaxed);
        }
    }

    /// Marker for shed frames, slotted just under the next outgoing frame's
    /// sequence. Evicted frames consumed sequence numbers ahead of `next`,
    /// so the slot is free and the stream stays strictly increasing; the
    /// gap below the marker is what tells the client frames were lost.
    fn take_resync_marker(&self, next: &Frame) -> Option<Frame> {
        if !self.lost_frames.swap(false, Ordering::Relaxed) {
            return None;
        }
        Some(Frame {
            frame_type: FrameType::ResyncRecommended,
            sequence: next.sequence.saturating_sub(1),
            payload: json!({"reason": "backpressure"}),
        })
    }
}

/// Fan-out hub for dashboard WebSocket subscribers. The broadcast side only
/// ever pushes into per-subscriber bounded queues; one writer task per
/// subscriber drains its own queue, so a slow client never stalls anyone
/// else.
pub struct Hub {
    subscribers: DashMap<u64, Arc<SubscriberHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    snapshot_rx: watch::Receiver<Arc<AggregateSnapshot>>,
    shutdown: Shutdown,
}

impl Hub {
    pub fn new(
        queue_capacity: usize,
        snapshot_rx: watch::Receiver<Arc<AggregateSnapshot>>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            queue_capacity,
            snapshot_rx,
            shutdown,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn broadcast(&self, frame_type: FrameType, payload: &Value) {
        for entry in self.subscribers.iter() {
            entry.value().enqueue(frame_type, payload.clone());
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SubscriberHandle::new(self.queue_capacity);

        let snapshot = self.snapshot_rx.borrow().clone();
        match serde_json::to_value(&*snapshot) {
            Ok(payload) => handle.enqueue(FrameType::Snapshot, payload),
            Err(err) => {
                tracing::error!(%err, "failed to encode snapshot for new subscriber");
                return;
            }
        }
        self.subscribers.insert(id, handle.clone());
        tracing::info!(subscriber = id, total = self.subscriber_count(), "subscriber connected");

        self.run_subscriber(id, handle, socket).await;

        self.subscribers.remove(&id);
        tracing::info!(subscriber = id, total = self.subscriber_count(), "subscriber gone");
    }

    async fn run_subscriber(
        &self,
        id: u64,
        handle: Arc<SubscriberHandle>,
        socket: WebSocket,
    ) {
        let (mut sink, mut stream) = socket.split();
        let mut ping = interval(PING_INTERVAL);
        let mut last_pong = Instant::now();
        let shutdown = self.shutdown.clone();
        let mut farewell_sent = false;

        loop {
            tokio::select! {
                maybe = handle.queue.pop() => {
                    let Some(frame) = maybe else { break };
                    if let Some(marker) = handle.take_resync_marker(&frame) {
                        if send_frame(&mut sink, &marker).await.is_err() {
                            break;
                        }
                    }
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if last_pong.elapsed() >= PONG_TIMEOUT {
                        tracing::debug!(subscriber = id, "ping timeout");
                        break;
                    }
                    if timeout(PONG_TIMEOUT, sink.send(Message::Ping(Vec::new())))
                        .await
                        .map_err(|_| ())
                        .and_then(|r| r.map_err(|_| ()))
                        .is_err()
                    {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                        Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
                            handle.enqueue(FrameType::Pong, json!({}));
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                _ = shutdown.wait(), if !farewell_sent => {
                    farewell_sent = true;
                    handle.enqueue(
                        FrameType::Alert,
                        json!({"kind": "farewell", "reason": "control plane shutting down"}),
                    );
                    let queue_ref = handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(FLUSH_GRACE).await;
                        queue_ref.queue.close();
                    });
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|err| {
        tracing::error!(%err, "frame serialization failed");
    })?;
    // A stalled peer must not pin this task past the liveness window.
    match timeout(PONG_TIMEOUT, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_monotone_and_gap_free_without_pressure() {
        let handle = SubscriberHandle::new(8);
        handle.enqueue(FrameType::Delta, json!({"n": 1}));
        handle.enqueue(FrameType::Delta, json!({"n": 2}));
        let first = handle.queue.try_pop().unwrap();
        let second = handle.queue.try_pop().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(!handle.lost_frames.load(Ordering::Relaxed));
    }

    #[test]
    fn backpressure_sheds_oldest_and_flags_resync() {
        let handle = SubscriberHandle::new(2);
        handle.enqueue(FrameType::Delta, json!({"n": 1}));
        handle.enqueue(FrameType::Delta, json!({"n": 2}));
        handle.enqueue(FrameType::Delta, json!({"n": 3}));
        assert!(handle.lost_frames.load(Ordering::Relaxed));
        // Oldest shed: the survivor sequence starts at 2.
        assert_eq!(handle.queue.try_pop().unwrap().sequence, 2);
        assert_eq!(handle.queue.try_pop().unwrap().sequence, 3);
    }

    #[test]
    fn resync_marker_never_regresses_the_sequence() {
        let handle = SubscriberHandle::new(2);
        for n in 1..=3 {
            handle.enqueue(FrameType::Delta, json!({"n": n}));
        }
        // Sequence 1 was shed; the writer pops sequence 2 next.
        let frame = handle.queue.try_pop().unwrap();
        assert_eq!(frame.sequence, 2);

        let marker = handle
            .take_resync_marker(&frame)
            .expect("eviction must raise a marker");
        assert_eq!(marker.frame_type, FrameType::ResyncRecommended);
        assert_eq!(marker.sequence, 1);
        assert!(
            marker.sequence < frame.sequence,
            "the wire stream must stay strictly increasing"
        );

        // One marker per loss burst.
        assert!(handle.take_resync_marker(&frame).is_none());
    }
}
