//! Typed event stream.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: when a
//! subscriber's queue is full the event is dropped for that subscriber, and
//! subscribers whose receiver is gone are removed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Kind of engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    ServerStarted,
    ServerStopped,
    ConfigLoaded,
    ConfigReloaded,
    ResponseSelected,
    RequestReceived,
    ResponseSent,
    TemplateTested,
    MatcherTested,
}

/// An event published by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Event>,
}

/// Receiving side of an event subscription.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// Fan-out of events to bounded per-subscriber queues.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus whose subscriber queues hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe with the bus's default queue capacity.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.capacity)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, sender });
        debug!(subscriber = id, capacity, "Event subscriber added");
        Subscription { id, receiver }
    }

    /// Remove a subscriber. Its pending events stay readable until drained.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Publish an event to every subscriber without waiting.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        let event = Event::new(kind, payload);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = subscriber.id, "Event subscriber gone, removing");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EventKind::ConfigLoaded, json!({"endpoints": 3}));

        let event = a.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ConfigLoaded);
        assert_eq!(event.payload["endpoints"], 3);
        assert_eq!(b.recv().await.unwrap().kind, EventKind::ConfigLoaded);
    }

    #[test]
    fn test_slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe_with_capacity(2);
        let mut fast = bus.subscribe_with_capacity(16);

        for i in 0..5 {
            bus.publish(EventKind::RequestReceived, json!({ "n": i }));
        }

        assert_eq!(bus.dropped_events(), 3);
        assert_eq!(slow.try_recv().unwrap().payload["n"], 0);
        assert_eq!(slow.try_recv().unwrap().payload["n"], 1);
        assert!(slow.try_recv().is_none());

        let mut received = 0;
        while fast.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
    }

    #[test]
    fn test_unsubscribe_and_dropped_receivers() {
        let bus = EventBus::new(4);
        let kept = bus.subscribe();
        let gone = bus.subscribe();
        let removed = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 3);

        assert!(bus.unsubscribe(removed.id()));
        assert!(!bus.unsubscribe(removed.id()));
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish(EventKind::ServerStarted, json!({}));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.id(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(EventKind::ResponseSent, json!({"status": 200}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "ResponseSent");
        assert_eq!(value["payload"]["status"], 200);
        assert!(value["timestamp"].is_string());
    }
}
