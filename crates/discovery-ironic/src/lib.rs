//! Discovery driver listing the bare metal nodes an OpenStack deployment
//! manages through a OneView driver.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod http;

pub use error::Error;
pub use http::{IronicInventory, IronicInventoryOptions, SERVICE_TYPE};

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovm_eventbus::{
    DiscoverySource, DriverError, InterestProbe, PolledDiscovery, PolledDiscoveryOptions,
};
use ovm_model::{MetricDescriptor, MetricSet, Node, NodeSet};
use serde::Deserialize;
use tracing::{debug, warn};

/// Name the driver is registered under.
pub const DRIVER_NAME: &str = "ironic";

/// Metric published for every managed node.
pub const METRIC_NAME: &str = "oneview.server_hardware";

/// Value of the `service` dimension.
pub const SERVICE_NAME: &str = "ironic";

/// Bare metal drivers backed by OneView.
pub const SUPPORTED_DRIVERS: [&str; 3] = ["agent_pxe_oneview", "iscsi_pxe_oneview", "fake_oneview"];

/// A node as reported by the bare metal API.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IronicNode {
    /// Node UUID.
    pub uuid: String,

    /// Bare metal driver name.
    pub driver: String,

    /// Driver specific properties.
    #[serde(default)]
    pub driver_info: serde_json::Map<String, serde_json::Value>,
}

impl IronicNode {
    /// Server hardware UUID, the last segment of
    /// `driver_info.server_hardware_uri`.
    #[must_use]
    pub fn server_hardware_uuid(&self) -> Option<&str> {
        self.driver_info
            .get("server_hardware_uri")
            .and_then(serde_json::Value::as_str)
            .and_then(|uri| uri.trim_end_matches('/').rsplit('/').next())
            .filter(|uuid| !uuid.is_empty())
    }
}

/// Source of bare metal nodes.
#[async_trait]
pub trait NodeInventory: Send + Sync + 'static {
    /// The error type for listings.
    type Error: StdError + Send + Sync + 'static;

    /// Every node with its details.
    async fn list_nodes(&self) -> Result<Vec<IronicNode>, Self::Error>;
}

/// Builds the interest nodes from a node listing. Nodes using another
/// driver are ignored.
#[must_use]
pub fn interest_nodes(nodes: &[IronicNode]) -> NodeSet {
    nodes
        .iter()
        .filter(|node| SUPPORTED_DRIVERS.contains(&node.driver.as_str()))
        .filter_map(|node| {
            let Some(uuid) = node.server_hardware_uuid() else {
                warn!(node = %node.uuid, "node has no server hardware uri");
                return None;
            };

            let dimensions = BTreeMap::from([
                ("resource_id".to_string(), node.uuid.clone()),
                ("server_hardware_uuid".to_string(), uuid.to_string()),
                ("service".to_string(), SERVICE_NAME.to_string()),
            ]);

            Some(Node::new(
                uuid,
                MetricSet::from([MetricDescriptor::new(METRIC_NAME, dimensions)]),
            ))
        })
        .collect()
}

/// Probes the inventory for OneView managed nodes.
pub struct IronicProbe<I> {
    inventory: Arc<I>,
}

impl<I> IronicProbe<I>
where
    I: NodeInventory,
{
    /// Creates a probe.
    pub const fn new(inventory: Arc<I>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl<I> InterestProbe for IronicProbe<I>
where
    I: NodeInventory,
{
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn interest_nodes(&self) -> Result<NodeSet, DriverError> {
        let nodes = self.inventory.list_nodes().await?;
        debug!(count = nodes.len(), "bare metal nodes listed");
        Ok(interest_nodes(&nodes))
    }
}

/// Builds the ironic discovery source.
pub fn driver<I>(inventory: Arc<I>, retry_interval: Duration) -> Arc<dyn DiscoverySource>
where
    I: NodeInventory,
{
    Arc::new(PolledDiscovery::new(PolledDiscoveryOptions {
        probe: Arc::new(IronicProbe::new(inventory)),
        retry_interval,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovm_eventbus::NodeSubscriber;
    use ovm_model::ResourceId;
    use serde_json::json;
    use std::sync::Mutex;

    fn ironic_node(uuid: &str, driver: &str, uri: Option<&str>) -> IronicNode {
        let driver_info = uri.map_or_else(serde_json::Map::new, |uri| {
            let mut info = serde_json::Map::new();
            info.insert("server_hardware_uri".to_string(), json!(uri));
            info
        });

        IronicNode {
            uuid: uuid.to_string(),
            driver: driver.to_string(),
            driver_info,
        }
    }

    #[test]
    fn test_interest_nodes_keep_oneview_drivers_only() {
        let nodes = vec![
            ironic_node("node-1", "agent_pxe_oneview", Some("/rest/server-hardware/sh-1")),
            ironic_node("node-2", "pxe_ipmitool", Some("/rest/server-hardware/sh-2")),
            ironic_node("node-3", "fake_oneview", None),
        ];

        let interest = interest_nodes(&nodes);

        assert_eq!(interest.len(), 1);
        let node = interest.iter().next().unwrap();
        assert_eq!(node.id, ResourceId::from("sh-1"));
        let metric = node.metrics.iter().next().unwrap();
        assert_eq!(
            metric.dimensions,
            BTreeMap::from([
                ("resource_id".to_string(), "node-1".to_string()),
                ("server_hardware_uuid".to_string(), "sh-1".to_string()),
                ("service".to_string(), "ironic".to_string()),
            ])
        );
    }

    #[test]
    fn test_node_deserializes_from_api_shape() {
        let node: IronicNode = serde_json::from_value(json!({
            "uuid": "node-1",
            "driver": "iscsi_pxe_oneview",
            "driver_info": { "server_hardware_uri": "/rest/server-hardware/sh-9/" },
            "power_state": "power on"
        }))
        .unwrap();

        assert_eq!(node.server_hardware_uuid(), Some("sh-9"));
    }

    struct FixedInventory(Vec<IronicNode>);

    #[async_trait]
    impl NodeInventory for FixedInventory {
        type Error = std::io::Error;

        async fn list_nodes(&self) -> Result<Vec<IronicNode>, Self::Error> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Collector(Mutex<Vec<ResourceId>>);

    #[async_trait]
    impl NodeSubscriber for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }

        async fn available(&self, nodes: &NodeSet) {
            self.0.lock().unwrap().extend(nodes.iter().map(|n| n.id.clone()));
        }

        async fn unavailable(&self, _nodes: &NodeSet) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_publishes_listed_nodes() {
        let inventory = Arc::new(FixedInventory(vec![ironic_node(
            "node-1",
            "agent_pxe_oneview",
            Some("/rest/server-hardware/sh-1"),
        )]));
        let source = driver(inventory, Duration::from_secs(300));
        let collector = Arc::new(Collector::default());
        source.subscribe(collector.clone());

        source.discover().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        source.stop().await.unwrap();

        assert_eq!(*collector.0.lock().unwrap(), vec![ResourceId::from("sh-1")]);
    }
}
