//! Per-session outbound buffer.
//!
//! Bounded at [`OUTBOUND_CAPACITY`] messages. Under pressure, snapshots give
//! way first: a snapshot arriving at a full buffer coalesces into a single
//! latest-frame slot, and a lifecycle event arriving at a full buffer evicts
//! the oldest queued snapshot. Only when the buffer is full of lifecycle
//! events does a push wait, and a wait that outlives its deadline closes the
//! session with a protocol error.

use crate::wire::OutboundMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

pub const OUTBOUND_CAPACITY: usize = 64;

/// The buffer stayed full of non-droppable messages past the deadline.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

struct Inner {
    queue: VecDeque<OutboundMessage>,
    /// Latest snapshot that could not be queued; delivered when the queue drains.
    pending_snapshot: Option<OutboundMessage>,
    closed: bool,
    dropped_snapshots: u64,
}

pub struct OutboundQueue {
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        OutboundQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                pending_snapshot: None,
                closed: false,
                dropped_snapshots: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a snapshot. Never blocks: a full buffer coalesces to the
    /// latest frame.
    pub fn push_snapshot(&self, message: OutboundMessage) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if inner.queue.len() < self.capacity {
            if inner.pending_snapshot.take().is_some() {
                // The parked frame is older than this one; let it go.
                inner.dropped_snapshots += 1;
            }
            inner.queue.push_back(message);
        } else {
            if inner.pending_snapshot.is_some() {
                inner.dropped_snapshots += 1;
            }
            inner.pending_snapshot = Some(message);
        }
        drop(inner);
        self.readable.notify_one();
    }

    /// Enqueue a lifecycle event. Evicts the oldest queued snapshot when
    /// full; with nothing to evict, waits up to `deadline` for space.
    pub async fn push_event(
        &self,
        message: OutboundMessage,
        deadline: Duration,
    ) -> Result<(), QueueFull> {
        let wait = tokio::time::sleep(deadline);
        tokio::pin!(wait);
        loop {
            // Register for the wakeup before inspecting state, or a consumer
            // freeing space between check and await is lost.
            let mut writable = std::pin::pin!(self.writable.notified());
            writable.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Ok(());
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(message);
                    drop(inner);
                    self.readable.notify_one();
                    return Ok(());
                }
                if let Some(position) = inner.queue.iter().position(OutboundMessage::is_snapshot) {
                    inner.queue.remove(position);
                    inner.dropped_snapshots += 1;
                    inner.queue.push_back(message);
                    drop(inner);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = &mut writable => {}
                _ = &mut wait => return Err(QueueFull),
            }
        }
    }

    /// Next message in FIFO order; a parked snapshot is delivered once the
    /// queue itself is empty. `None` after close and drain.
    pub async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            let mut readable = std::pin::pin!(self.readable.notified());
            readable.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(message) = inner.queue.pop_front() {
                    drop(inner);
                    self.writable.notify_one();
                    return Some(message);
                }
                if let Some(snapshot) = inner.pending_snapshot.take() {
                    return Some(snapshot);
                }
                if inner.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn dropped_snapshots(&self) -> u64 {
        self.lock().dropped_snapshots
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(n: u64) -> OutboundMessage {
        OutboundMessage {
            message_type: "bot_snapshot",
            body: json!({ "type": "bot_snapshot", "n": n }),
        }
    }

    fn event(n: u64) -> OutboundMessage {
        OutboundMessage {
            message_type: "bot_status",
            body: json!({ "type": "bot_status", "n": n }),
        }
    }

    #[tokio::test]
    async fn fifo_within_capacity() {
        let queue = OutboundQueue::new(4);
        queue.push_event(event(1), Duration::from_millis(10)).await.unwrap();
        queue.push_snapshot(snapshot(2));
        queue.push_event(event(3), Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.pop().await.unwrap().body["n"], 1);
        assert_eq!(queue.pop().await.unwrap().body["n"], 2);
        assert_eq!(queue.pop().await.unwrap().body["n"], 3);
    }

    #[tokio::test]
    async fn full_buffer_coalesces_snapshots_to_latest() {
        let queue = OutboundQueue::new(2);
        queue.push_snapshot(snapshot(1));
        queue.push_snapshot(snapshot(2));
        // Buffer full: these park in the latest-frame slot.
        queue.push_snapshot(snapshot(3));
        queue.push_snapshot(snapshot(4));
        assert_eq!(queue.dropped_snapshots(), 1);

        assert_eq!(queue.pop().await.unwrap().body["n"], 1);
        assert_eq!(queue.pop().await.unwrap().body["n"], 2);
        assert_eq!(queue.pop().await.unwrap().body["n"], 4);
    }

    #[tokio::test]
    async fn event_evicts_oldest_snapshot_when_full() {
        let queue = OutboundQueue::new(2);
        queue.push_snapshot(snapshot(1));
        queue.push_snapshot(snapshot(2));
        queue.push_event(event(3), Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.dropped_snapshots(), 1);

        assert_eq!(queue.pop().await.unwrap().body["n"], 2);
        assert_eq!(queue.pop().await.unwrap().body["n"], 3);
    }

    #[tokio::test]
    async fn event_push_times_out_when_full_of_events() {
        let queue = OutboundQueue::new(2);
        queue.push_event(event(1), Duration::from_millis(10)).await.unwrap();
        queue.push_event(event(2), Duration::from_millis(10)).await.unwrap();
        let result = queue.push_event(event(3), Duration::from_millis(50)).await;
        assert_eq!(result, Err(QueueFull));
    }

    #[tokio::test]
    async fn event_push_waits_for_consumer() {
        let queue = std::sync::Arc::new(OutboundQueue::new(1));
        queue.push_event(event(1), Duration::from_millis(10)).await.unwrap();
        let producer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move {
                queue.push_event(event(2), Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pop().await.unwrap().body["n"], 1);
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await.unwrap().body["n"], 2);
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let queue = OutboundQueue::new(4);
        queue.push_event(event(1), Duration::from_millis(10)).await.unwrap();
        queue.close();
        assert_eq!(queue.pop().await.unwrap().body["n"], 1);
        assert!(queue.pop().await.is_none());
    }

    /// Stalled consumer versus a fast snapshot producer: every lifecycle
    /// event arrives exactly once and in order, while snapshot delivery is
    /// bounded by the buffer policy (the rest are dropped or coalesced).
    #[tokio::test]
    async fn stalled_consumer_keeps_every_lifecycle_event() {
        let queue = OutboundQueue::new(16);
        let mut expected_events = Vec::new();
        for n in 0..100u64 {
            queue.push_snapshot(snapshot(n));
            if n % 10 == 0 {
                queue.push_event(event(1000 + n), Duration::from_millis(50)).await.unwrap();
                expected_events.push(1000 + n);
            }
        }
        queue.close();

        let mut seen_events = Vec::new();
        let mut seen_snapshots = 0u64;
        while let Some(message) = queue.pop().await {
            if message.is_snapshot() {
                seen_snapshots += 1;
            } else {
                seen_events.push(message.body["n"].as_u64().unwrap());
            }
        }
        assert_eq!(seen_events, expected_events);
        // At most a full buffer of snapshots plus the parked latest frame.
        assert!(seen_snapshots <= 17, "got {seen_snapshots} snapshots");
        assert_eq!(queue.dropped_snapshots(), 100 - seen_snapshots);
    }
}
