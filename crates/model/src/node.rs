use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::metric::MetricSet;

/// Opaque identity of one monitored hardware unit (the server hardware UUID).
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates an identity from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A resource together with the metrics currently known for it.
///
/// Hashing is by identity only; equality also compares the metric set, so a
/// discovery source can detect that a resource's metrics changed.
#[derive(Clone, Debug)]
pub struct Node {
    /// Identity of the resource.
    pub id: ResourceId,

    /// Metrics currently associated with the resource.
    pub metrics: MetricSet,
}

impl Node {
    /// Creates a node from an identity and its metrics.
    pub fn new(id: impl Into<ResourceId>, metrics: MetricSet) -> Self {
        Self {
            id: id.into(),
            metrics,
        }
    }

    /// Metric names, sorted, for log output.
    #[must_use]
    pub fn metric_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.metrics.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.metrics == other.metrics
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A batch of nodes as exchanged between discovery sources and subscribers.
pub type NodeSet = HashSet<Node>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricDescriptor;
    use std::collections::BTreeMap;

    #[test]
    fn test_nodes_differ_when_metrics_differ() {
        let empty = Node::new("sh-1", MetricSet::new());
        let populated = Node::new(
            "sh-1",
            MetricSet::from([MetricDescriptor::new("a", BTreeMap::new())]),
        );

        assert_ne!(empty, populated);
        assert_eq!(empty, Node::new("sh-1", MetricSet::new()));
    }

    #[test]
    fn test_metric_names_sorted() {
        let node = Node::new(
            "sh-1",
            MetricSet::from([
                MetricDescriptor::new("b", BTreeMap::new()),
                MetricDescriptor::new("a", BTreeMap::new()),
            ]),
        );

        assert_eq!(node.metric_names(), vec!["a", "b"]);
    }
}
