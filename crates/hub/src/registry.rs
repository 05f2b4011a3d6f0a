//! The observer registry: the set of live connections plus the fan-out
//! engine.

use std::{collections::HashMap, sync::Arc};

use {tokio::sync::RwLock, tracing::debug};

use trellis_protocol::{Address, Event};

use crate::observer::Observer;

/// Set of admitted observers keyed by address. Notify may run concurrently
/// with membership changes; fan-out works over a snapshot so mutation never
/// blocks behind a slow write.
#[derive(Default)]
pub struct Registry {
    observers: RwLock<HashMap<Address, Arc<Observer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert; idempotent. A reconnect under the same address replaces the
    /// stale entry.
    pub async fn register(&self, observer: Arc<Observer>) {
        let mut observers = self.observers.write().await;
        observers.insert(observer.key().clone(), observer);
    }

    /// Remove; idempotent. Only removes the caller's own entry, so a
    /// replacement registered under the same address survives the stale
    /// connection's teardown. The observer's closed latch is set before
    /// removal, so no notify lands after this returns.
    pub async fn deregister(&self, observer: &Arc<Observer>) {
        observer.begin_close();
        let mut observers = self.observers.write().await;
        let owns_entry = observers
            .get(observer.key())
            .is_some_and(|current| Arc::ptr_eq(current, observer));
        if owns_entry {
            observers.remove(observer.key());
        }
    }

    /// Fan an event out to every observer whose address matches the receiver
    /// pattern. Best-effort per subscriber; one broken transport never stops
    /// delivery to the rest.
    pub async fn notify(&self, event: &Event, sender: &Address, receiver: &Address) {
        let snapshot = self.snapshot().await;
        debug!(
            action = %event.action,
            receiver = %receiver,
            observers = snapshot.len(),
            "routing event"
        );
        for observer in snapshot {
            if observer.address().matches(receiver) {
                observer.on_notify(event, sender, receiver).await;
            }
        }
    }

    /// Deliver to every observer regardless of address match.
    pub async fn broadcast(&self, event: &Event, sender: &Address) {
        for observer in self.snapshot().await {
            let receiver = observer.address().clone();
            observer.on_notify(event, sender, &receiver).await;
        }
    }

    /// Close every observer and drain the registry.
    pub async fn close(&self, event: &Event) {
        let drained: Vec<Arc<Observer>> = {
            let mut observers = self.observers.write().await;
            observers.drain().map(|(_, o)| o).collect()
        };
        debug!(observers = drained.len(), "closing registry");
        for observer in drained {
            observer.begin_close();
            observer.on_close(event).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.read().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<Arc<Observer>> {
        self.observers.read().await.values().cloned().collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use {
        crate::testutil::{RecordingSink, addr},
        trellis_protocol::Action,
    };

    #[tokio::test]
    async fn at_most_one_observer_per_address() {
        let registry = Registry::new();
        let first = Observer::new(addr("demo.iot.h1.*.*"), RecordingSink::new());
        let second = Observer::new(addr("demo.iot.h1.*.*"), RecordingSink::new());

        registry.register(Arc::clone(&first)).await;
        registry.register(Arc::clone(&first)).await;
        registry.register(Arc::clone(&second)).await;
        assert_eq!(registry.len().await, 1);

        // The stale connection's teardown must not evict the replacement.
        registry.deregister(&first).await;
        assert_eq!(registry.len().await, 1);
        registry.deregister(&second).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn notify_reaches_exactly_the_matching_observers() {
        let registry = Registry::new();
        let iot_sink = RecordingSink::new();
        let cli_sink = RecordingSink::new();
        registry
            .register(Observer::new(addr("demo.iot.h1.*.*"), iot_sink.clone()))
            .await;
        registry
            .register(Observer::new(addr("demo.cli.box.*.*"), cli_sink.clone()))
            .await;

        registry
            .notify(
                &Event::new(Action::Value, serde_json::json!(42)),
                &addr("demo.cli.box.*.*"),
                &addr("demo.iot.h1.*.*"),
            )
            .await;

        assert_eq!(iot_sink.frames().len(), 1);
        assert!(cli_sink.frames().is_empty());
    }

    #[tokio::test]
    async fn no_notify_after_deregister_returns() {
        let registry = Registry::new();
        let sink = RecordingSink::new();
        let observer = Observer::new(addr("demo.iot.h1.*.*"), sink.clone());
        registry.register(Arc::clone(&observer)).await;
        registry.deregister(&observer).await;

        registry
            .notify(&Event::text("late"), &addr("demo.cli.*.*.*"), &Address::default())
            .await;
        observer
            .on_notify(&Event::text("later"), &addr("demo.cli.*.*.*"), &Address::default())
            .await;

        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn broadcast_ignores_address_match() {
        let registry = Registry::new();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        registry
            .register(Observer::new(addr("demo.iot.h1.*.*"), a.clone()))
            .await;
        registry
            .register(Observer::new(addr("other.cli.x.*.*"), b.clone()))
            .await;

        registry
            .broadcast(&Event::text("hello all"), &addr("demo.server.hub.main.1"))
            .await;

        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames().len(), 1);
    }

    #[tokio::test]
    async fn close_drains_and_sends_close_frames() {
        let registry = Registry::new();
        let sinks: Vec<_> = (0..3).map(|_| RecordingSink::new()).collect();
        for (i, sink) in sinks.iter().enumerate() {
            registry
                .register(Observer::new(addr(&format!("demo.iot.h{i}.*.*")), sink.clone()))
                .await;
        }

        registry.close(&Event::text("Setup done")).await;

        assert!(registry.is_empty().await);
        for sink in sinks {
            assert_eq!(sink.closes.load(std::sync::atomic::Ordering::Acquire), 1);
        }
    }

    #[tokio::test]
    async fn notify_survives_concurrent_membership_changes() {
        let registry = Arc::new(Registry::new());
        let stable = RecordingSink::new();
        registry
            .register(Observer::new(addr("demo.iot.stable.*.*"), stable.clone()))
            .await;

        let churn = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..32 {
                    let o = Observer::new(addr(&format!("demo.iot.h{i}.*.*")), RecordingSink::new());
                    registry.register(Arc::clone(&o)).await;
                    registry.deregister(&o).await;
                }
            })
        };

        for _ in 0..32 {
            registry
                .notify(&Event::text("tick"), &addr("demo.server.hub.main.1"), &Address::default())
                .await;
        }
        churn.await.unwrap();

        assert_eq!(stable.frames().len(), 32);
    }
}
