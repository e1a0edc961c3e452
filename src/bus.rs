//! Event Bus
//!
//! In-process pub/sub with bounded per-subscriber queues and drop-oldest
//! overflow. Each subscriber owns an independent bounded deque guarded by a
//! mutex plus a `Notify`, rather than sharing one ring buffer the way
//! `tokio::sync::broadcast` does — a subscriber that never drains loses only
//! its own oldest envelopes, and publish never blocks on a slow consumer.
//! Mirrors the retry-once algorithm in the original system's `bus.py`
//! (`put_nowait` → on `QueueFull`, `get_nowait` once, retry `put_nowait`).

use crate::clock::{new_id, SortableId};
use crate::event::EventEnvelope;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// Per-subscriber queue capacity (spec §3: Subscriber Queue).
pub const QUEUE_CAPACITY: usize = 10_000;

/// Opaque subscriber identity returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(SortableId);

struct Queue {
    items: parking_lot::Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl Queue {
    fn new() -> Self {
        Self {
            items: parking_lot::Mutex::new(VecDeque::with_capacity(64)),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, id: SubscriberId, envelope: EventEnvelope) {
        let mut items = self.items.lock();
        if items.len() >= QUEUE_CAPACITY {
            items.pop_front();
            if items.len() >= QUEUE_CAPACITY {
                warn!(subscriber = ?id, "subscriber queue still full after dropping oldest, dropping newest");
                return;
            }
        }
        items.push_back(envelope);
        drop(items);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// A subscriber's receiving end. Not `Clone`: one queue, one consumer.
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<Queue>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for and returns the next envelope, in publish order. Returns
    /// `None` once the bus has unsubscribed this queue.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            if let Some(env) = self.queue.items.lock().pop_front() {
                return Some(env);
            }
            if self.queue.closed.load(std::sync::atomic::Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking poll; returns `None` if the queue is currently empty
    /// (whether or not it is closed).
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.queue.items.lock().pop_front()
    }
}

/// Bounded, non-blocking-publish fan-out hub.
pub struct EventBus {
    subscribers: parking_lot::RwLock<HashMap<SubscriberId, Arc<Queue>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new bounded queue and returns a subscription handle to it.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(new_id());
        let queue = Arc::new(Queue::new());
        self.subscribers.write().insert(id, queue.clone());
        Subscription { id, queue }
    }

    /// Removes the queue and releases any blocked consumer.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some(queue) = self.subscribers.write().remove(&id) {
            queue.close();
        }
    }

    /// Attempts non-blocking enqueue to every live subscriber. On queue-full,
    /// dequeues the oldest element and retries once; if still full, drops the
    /// new envelope for that subscriber only. Never blocks, never fails.
    pub fn publish(&self, envelope: EventEnvelope) {
        let subscribers = self.subscribers.read();
        for (id, queue) in subscribers.iter() {
            queue.push(*id, envelope.clone());
        }
    }

    /// Current subscriber count, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::component;

    fn envelope(session: SortableId, n: u32) -> EventEnvelope {
        EventEnvelope::new(
            session,
            component::SYSTEM,
            "test_event",
            crate::event::payload([("n", serde_json::json!(n))]),
        )
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let session = new_id();

        for n in 0..5 {
            bus.publish(envelope(session, n));
        }

        for expected in 0..5 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.payload.get("n").unwrap(), &serde_json::json!(expected));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_others() {
        let bus = EventBus::new();
        let slow = bus.subscribe();
        let mut fast = bus.subscribe();
        let session = new_id();

        // Never drain `slow`; hold it so its queue keeps accumulating.
        let _slow = slow;

        for n in 0..100 {
            bus.publish(envelope(session, n));
        }

        let got = fast.recv().await.unwrap();
        assert_eq!(got.payload.get("n").unwrap(), &serde_json::json!(0));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_keeps_publishing() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let session = new_id();

        for n in 0..(QUEUE_CAPACITY as u32 + 10) {
            bus.publish(envelope(session, n));
        }

        let first = sub.recv().await.unwrap();
        // The oldest 10 envelopes (n = 0..10) were evicted to make room.
        assert_eq!(first.payload.get("n").unwrap(), &serde_json::json!(10));
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let id = sub.id();
        bus.unsubscribe(id);
        assert!(sub.recv().await.is_none());
    }
}
