use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("transport closed")]
    TransportClosed,
}

pub type Result<T> = std::result::Result<T, BusError>;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const DEFAULT_BUFFER: usize = 256;

struct SubscriberSlot {
    tx: flume::Sender<Value>,
    /// Mirror of the subscriber's receiver, used to drop the oldest pending
    /// delivery when the buffer is full. The producer never blocks.
    rx_mirror: flume::Receiver<Value>,
}

struct Inner {
    topics: Mutex<AHashMap<String, Vec<SubscriberSlot>>>,
    closed: AtomicBool,
    dropped: AtomicU64,
    buffer: usize,
}

/// Exact-topic pub/sub built on bounded flume channels.
///
/// Each `subscribe` creates a fresh receiver that sees every message
/// published to that topic afterwards; there is no replay. Messages from one
/// producer on one topic arrive in publication order. Slow subscribers lose
/// their oldest pending delivery instead of blocking the producer; every
/// drop is counted.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Bus with a custom per-subscriber buffer size.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(AHashMap::new()),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a subscriber on an exact topic. Dropping the returned
    /// `Subscription` detaches it; the dead slot is pruned on the next
    /// publish to that topic.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = flume::bounded(self.inner.buffer);
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        topics.entry(topic.clone()).or_default().push(SubscriberSlot {
            tx,
            rx_mirror: rx.clone(),
        });
        Subscription { topic, rx }
    }

    /// Deliver a payload to every current subscriber of the exact topic.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::TransportClosed);
        }
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        let Some(slots) = topics.get_mut(topic) else {
            return Ok(());
        };
        slots.retain(|slot| !slot.tx.is_disconnected());
        for slot in slots.iter() {
            let mut msg = payload.clone();
            loop {
                match slot.tx.try_send(msg) {
                    Ok(()) => break,
                    Err(flume::TrySendError::Full(returned)) => {
                        // Shed the subscriber's oldest pending delivery.
                        if slot.rx_mirror.try_recv().is_ok() {
                            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        msg = returned;
                    }
                    Err(flume::TrySendError::Disconnected(_)) => break,
                }
            }
        }
        if slots.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }

    /// Stop the bus: subsequent publishes fail with `TransportClosed` and all
    /// subscriber channels end.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        topics.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.lock().expect("bus lock poisoned");
        topics
            .get(topic)
            .map(|slots| slots.iter().filter(|s| !s.tx.is_disconnected()).count())
            .unwrap_or(0)
    }

    /// Total deliveries shed because a subscriber's buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live subscription handle. Dropping it detaches the subscriber.
pub struct Subscription {
    topic: String,
    rx: flume::Receiver<Value>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Await the next delivery; `None` when the bus has closed.
    pub async fn recv(&self) -> Option<Value> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_reaches_exact_topic_only() {
        let bus = EventBus::new();
        let tickets = bus.subscribe("/tickets");
        let agents = bus.subscribe("/agents");

        bus.publish("/tickets", json!({"n": 1})).unwrap();
        assert_eq!(tickets.try_recv(), Some(json!({"n": 1})));
        assert_eq!(agents.try_recv(), None);
    }

    #[test]
    fn publication_order_preserved_per_topic() {
        let bus = EventBus::new();
        let sub = bus.subscribe("/tickets");
        for i in 0..10 {
            bus.publish("/tickets", json!(i)).unwrap();
        }
        for i in 0..10 {
            assert_eq!(sub.try_recv(), Some(json!(i)));
        }
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish("/tickets", json!("early")).unwrap();
        let sub = bus.subscribe("/tickets");
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn slow_subscriber_loses_oldest_not_producer() {
        let bus = EventBus::with_buffer(2);
        let sub = bus.subscribe("/tickets");
        for i in 0..5 {
            bus.publish("/tickets", json!(i)).unwrap();
        }
        // Buffer kept the most recent two; three deliveries were shed.
        assert_eq!(bus.dropped_count(), 3);
        assert_eq!(sub.try_recv(), Some(json!(3)));
        assert_eq!(sub.try_recv(), Some(json!(4)));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe("/tickets");
        assert_eq!(bus.subscriber_count("/tickets"), 1);
        drop(sub);
        bus.publish("/tickets", json!(1)).unwrap();
        assert_eq!(bus.subscriber_count("/tickets"), 0);
    }

    #[test]
    fn closed_bus_rejects_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe("/tickets");
        bus.close();
        assert!(matches!(
            bus.publish("/tickets", json!(1)),
            Err(BusError::TransportClosed)
        ));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn async_recv_sees_publishes() {
        let bus = EventBus::new();
        let sub = bus.subscribe("/agents/a1/tasks");
        let bus2 = bus.clone();
        tokio::spawn(async move {
            bus2.publish("/agents/a1/tasks", json!({"task_id": "t"})).unwrap();
        });
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg["task_id"], "t");
    }
}
