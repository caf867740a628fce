//! In-process pub/sub feeding the SSE endpoint.
//!
//! Each subscriber owns a bounded queue (capacity 100). Publishing never
//! blocks: when a queue is full the newest event is dropped for that
//! subscriber, and closed receivers are pruned on the next publish.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct GraphEvent {
    pub event: String,
    pub data: Value,
}

impl GraphEvent {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<GraphEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<GraphEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: GraphEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            // Drop-newest on overflow; per-subscriber failures are swallowed.
            let _ = tx.try_send(event.clone());
        }
    }

    pub fn publish_all(&self, events: Vec<GraphEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(GraphEvent::new("node_added", json!({"id": "n1"})));
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.event, "node_added");
        assert_eq!(evt.data["id"], "n1");
    }

    #[tokio::test]
    async fn overflow_drops_newest_silently() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(GraphEvent::new("node_added", json!({ "i": i })));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(GraphEvent::new("edges_added", json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
