use std::collections::BTreeSet;

use ovm_model::{NodeSet, ResourceId};
use parking_lot::Mutex;
use tracing::info;

/// Identities a producer currently reports status for.
///
/// A resource joins on `available` and only leaves once `unavailable`
/// reports it with no metric left.
#[derive(Debug, Default)]
pub struct MonitoredSet {
    ids: Mutex<BTreeSet<ResourceId>>,
}

impl MonitoredSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts monitoring every node in `nodes`.
    pub fn track(&self, nodes: &NodeSet) {
        let mut ids = self.ids.lock();
        for node in nodes {
            info!(resource = %node.id, metrics = ?node.metric_names(), "node discovered");
            ids.insert(node.id.clone());
        }
    }

    /// Stops monitoring the nodes in `nodes` whose metric set is empty.
    pub fn untrack_empty(&self, nodes: &NodeSet) {
        let mut ids = self.ids.lock();
        for node in nodes.iter().filter(|node| node.metrics.is_empty()) {
            if ids.remove(&node.id) {
                info!(resource = %node.id, "node removed");
            }
        }
    }

    /// Whether `id` is monitored.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.ids.lock().contains(id)
    }

    /// Monitored identities, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceId> {
        self.ids.lock().iter().cloned().collect()
    }

    /// Number of monitored identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Whether nothing is monitored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}
