use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A named metric definition plus its dimension tags.
///
/// Equality and hashing only consider `name`: two descriptors that share a
/// name collapse to one entry in a [`MetricSet`] even if their dimensions
/// differ.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetricDescriptor {
    /// Metric name, e.g. `oneview.server_hardware`.
    pub name: String,

    /// Dimension tags attached to every measurement of this metric.
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl MetricDescriptor {
    /// Creates a descriptor from a name and its dimensions.
    pub fn new(name: impl Into<String>, dimensions: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            dimensions,
        }
    }
}

impl PartialEq for MetricDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MetricDescriptor {}

impl Hash for MetricDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Set of metric descriptors, deduplicated by name.
pub type MetricSet = HashSet<MetricDescriptor>;

/// Adds every metric in `incoming` to `target`. A descriptor whose name is
/// already present replaces the stored one, so the last write wins.
///
/// Returns `true` if `target` changed in any observable way.
pub fn merge_metrics(target: &mut MetricSet, incoming: &MetricSet) -> bool {
    let mut changed = false;

    for metric in incoming {
        match target.replace(metric.clone()) {
            Some(previous) => changed |= previous.dimensions != metric.dimensions,
            None => changed = true,
        }
    }

    changed
}

/// Removes every metric from `target` whose name appears in `removed`.
pub fn remove_metrics(target: &mut MetricSet, removed: &MetricSet) {
    for metric in removed {
        target.remove(metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, service: &str) -> MetricDescriptor {
        MetricDescriptor::new(
            name,
            BTreeMap::from([("service".to_string(), service.to_string())]),
        )
    }

    #[test]
    fn test_equality_ignores_dimensions() {
        assert_eq!(
            metric("oneview.server_hardware", "ironic"),
            metric("oneview.server_hardware", "compute")
        );
        assert_ne!(metric("a", "ironic"), metric("b", "ironic"));
    }

    #[test]
    fn test_merge_same_name_last_write_wins() {
        let mut stored = MetricSet::from([metric("oneview.server_hardware", "ironic")]);
        let incoming = MetricSet::from([metric("oneview.server_hardware", "compute")]);

        assert!(merge_metrics(&mut stored, &incoming));
        assert_eq!(stored.len(), 1);

        let kept = stored.iter().next().unwrap();
        assert_eq!(kept.dimensions["service"], "compute");
    }

    #[test]
    fn test_merge_identical_reports_no_change() {
        let mut stored = MetricSet::from([metric("a", "x")]);
        let incoming = MetricSet::from([metric("a", "x")]);

        assert!(!merge_metrics(&mut stored, &incoming));
    }

    #[test]
    fn test_remove_by_name() {
        let mut stored = MetricSet::from([metric("a", "x"), metric("b", "x")]);
        remove_metrics(&mut stored, &MetricSet::from([metric("a", "other")]));

        assert_eq!(stored, MetricSet::from([metric("b", "x")]));
    }
}
