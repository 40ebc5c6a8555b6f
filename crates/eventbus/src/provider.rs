use std::collections::BTreeMap;
use std::sync::Arc;

use ovm_model::{NodeSet, StatusSet};
use parking_lot::RwLock;
use tracing::debug;

use crate::subscriber::{NodeSubscriber, StatusSubscriber, SubscriberError};

/// Listener registry a discovery source embeds to publish availability.
///
/// Listeners are keyed by name; subscribing a second listener under a name
/// already taken is a no-op.
#[derive(Default)]
pub struct NodeProvider {
    listeners: RwLock<BTreeMap<String, Arc<dyn NodeSubscriber>>>,
}

impl NodeProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener unless one with the same name exists.
    pub fn subscribe(&self, listener: Arc<dyn NodeSubscriber>) {
        let name = listener.name().to_string();
        self.listeners.write().entry(name).or_insert(listener);
    }

    /// Removes the listener registered under `name`, if any.
    pub fn unsubscribe(&self, name: &str) {
        self.listeners.write().remove(name);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Forwards newly available nodes to every listener.
    pub async fn available(&self, nodes: &NodeSet) {
        for listener in self.snapshot() {
            debug!(listener = listener.name(), count = nodes.len(), "forwarding available nodes");
            listener.available(nodes).await;
        }
    }

    /// Forwards withdrawn nodes to every listener.
    pub async fn unavailable(&self, nodes: &NodeSet) {
        for listener in self.snapshot() {
            debug!(listener = listener.name(), count = nodes.len(), "forwarding unavailable nodes");
            listener.unavailable(nodes).await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn NodeSubscriber>> {
        self.listeners.read().values().cloned().collect()
    }
}

/// Subscriber registry a status producer embeds to publish status updates.
#[derive(Default)]
pub struct StatusProvider {
    subscribers: RwLock<BTreeMap<String, Arc<dyn StatusSubscriber>>>,
}

impl StatusProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber unless one with the same name exists.
    pub fn subscribe(&self, subscriber: Arc<dyn StatusSubscriber>) {
        let name = subscriber.name().to_string();
        self.subscribers.write().entry(name).or_insert(subscriber);
    }

    /// Removes the subscriber registered under `name`, if any.
    pub fn unsubscribe(&self, name: &str) {
        self.subscribers.write().remove(name);
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether no subscriber is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Delivers `statuses` to every subscriber, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a subscriber.
    pub async fn status_update(&self, statuses: &StatusSet) -> Result<(), SubscriberError> {
        let subscribers: Vec<_> = self.subscribers.read().values().cloned().collect();

        for subscriber in subscribers {
            subscriber.status_update(statuses).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusSubscriber for Counter {
        fn name(&self) -> &str {
            self.name
        }

        async fn status_update(&self, _statuses: &StatusSet) -> Result<(), SubscriberError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_status_provider_keys_by_name() {
        let provider = StatusProvider::new();
        let first = Arc::new(Counter {
            name: "keeper",
            calls: AtomicUsize::new(0),
        });
        let duplicate = Arc::new(Counter {
            name: "keeper",
            calls: AtomicUsize::new(0),
        });

        provider.subscribe(first.clone());
        provider.subscribe(duplicate.clone());
        assert_eq!(provider.len(), 1);

        provider.status_update(&StatusSet::new()).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(duplicate.calls.load(Ordering::SeqCst), 0);

        provider.unsubscribe("keeper");
        provider.unsubscribe("keeper");
        assert!(provider.is_empty());
    }
}
