//! Process-wide change-notification broker.
//!
//! Subscribers get a bounded channel of capacity 1. `notify` is a
//! non-blocking try-send to every subscriber: a full channel simply drops
//! the message, because notifications are edges ("something changed"), not
//! deliveries — a consumer that wakes up re-reads authoritative state.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Subscriber handle returned by [`EventBroker::subscribe`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

struct Inner {
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_id: u64,
    shut_down: bool,
}

/// Fan-out point for "something changed" notifications.
pub struct EventBroker {
    inner: Mutex<Inner>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                next_id: 0,
                shut_down: false,
            }),
        }
    }

    /// Register a subscriber. After shutdown, the returned channel is
    /// already closed.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.shut_down {
            inner.subscribers.insert(id, tx);
        }
        Subscription { id, rx }
    }

    /// Remove a subscriber; its channel closes.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    /// Push `msg` to every subscriber, dropping on full channels.
    pub fn notify(&self, msg: &str) {
        let inner = self.inner.lock().unwrap();
        for tx in inner.subscribers.values() {
            // Overflow means the subscriber already has a pending edge.
            let _ = tx.try_send(msg.to_string());
        }
    }

    /// Close every subscriber channel and empty the set. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;
        inner.subscribers.clear();
        tracing::debug!("event broker shut down");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_reaches_subscriber() {
        let broker = EventBroker::new();
        let mut sub = broker.subscribe();
        broker.notify("update");
        assert_eq!(sub.rx.recv().await.as_deref(), Some("update"));
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let broker = EventBroker::new();
        let mut sub = broker.subscribe();
        broker.notify("first");
        broker.notify("second"); // dropped — channel capacity is 1
        broker.notify("third"); // dropped

        assert_eq!(sub.rx.recv().await.as_deref(), Some("first"));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let broker = EventBroker::new();
        let mut sub = broker.subscribe();
        broker.unsubscribe(sub.id);
        assert_eq!(sub.rx.recv().await, None);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_all() {
        let broker = EventBroker::new();
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.shutdown();
        broker.shutdown();

        assert_eq!(a.rx.recv().await, None);
        assert_eq!(b.rx.recv().await, None);

        // Late subscribers get an already-closed channel.
        let mut late = broker.subscribe();
        assert_eq!(late.rx.recv().await, None);
    }
}
