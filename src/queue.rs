use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded FIFO that sheds the oldest entry instead of blocking the producer.
///
/// Both the ingest buffer and the per-subscriber frame queues ride on this:
/// the live dashboard only ever cares about recency, so under overload the
/// queue keeps the newest items and counts what it shed.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Outcome of a push; `Evicted` means the oldest entry was shed to make room.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Evicted,
    Closed,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closed {
                return PushOutcome::Closed;
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            inner.items.push_back(item);
            if evicted {
                PushOutcome::Evicted
            } else {
                PushOutcome::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next item; returns `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .items
            .pop_front()
    }

    /// Stops accepting new items; pending ones remain poppable.
    pub fn close(&self) {
        self.inner.lock().expect("queue lock poisoned").closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
