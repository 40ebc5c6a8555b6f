//! Discovery driver fed by a static YAML list of MAC addresses.
//!
//! Every entry names a MAC address and the dimensions to attach to the
//! metric of the server hardware owning it:
//!
//! ```yaml
//! servers:
//!   - mac-addr: "aa:bb:cc:dd:ee:ff"
//!     dimensions:
//!       service: compute
//!       hostname: compute-01
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovm_eventbus::{
    DiscoverySource, DriverError, InterestProbe, PolledDiscovery, PolledDiscoveryOptions,
};
use ovm_hardware::ServerHardwareLookup;
use ovm_model::{MetricDescriptor, MetricSet, Node, NodeSet};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Name the driver is registered under.
pub const DRIVER_NAME: &str = "serverlist";

/// Metric published for every resolved server.
pub const METRIC_NAME: &str = "oneview.server_hardware";

/// One entry of the MAC file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerEntry {
    /// MAC address of one of the server's ports.
    #[serde(rename = "mac-addr")]
    pub mac_addr: String,

    /// Dimensions attached to the server's metric.
    #[serde(default)]
    pub dimensions: BTreeMap<String, serde_yaml::Value>,
}

impl ServerEntry {
    fn string_dimensions(&self) -> BTreeMap<String, String> {
        self.dimensions
            .iter()
            .map(|(key, value)| (key.clone(), value_to_string(value)))
            .collect()
    }
}

fn value_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct MacFile {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

/// Parses the contents of a MAC file. An empty document lists no server.
///
/// # Errors
///
/// Returns an error if the document is not a valid MAC file.
pub fn parse_mac_file(contents: &str) -> Result<Vec<ServerEntry>, Error> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let file: Option<MacFile> = serde_yaml::from_str(contents)?;
    Ok(file.unwrap_or_default().servers)
}

/// Resolves the MAC file entries to server hardware through the appliance.
pub struct ServerListProbe<L> {
    lookup: Arc<L>,
    mac_file_path: PathBuf,
    servers: RwLock<Vec<ServerEntry>>,
}

impl<L> ServerListProbe<L>
where
    L: ServerHardwareLookup,
{
    /// Creates a probe. The MAC file is read when discovery starts.
    pub fn new(lookup: Arc<L>, mac_file_path: impl Into<PathBuf>) -> Self {
        Self {
            lookup,
            mac_file_path: mac_file_path.into(),
            servers: RwLock::new(Vec::new()),
        }
    }

    /// Reads and parses the MAC file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load_mac_file(&self) -> Result<usize, Error> {
        let contents = tokio::fs::read_to_string(&self.mac_file_path)
            .await
            .map_err(|source| Error::ReadMacFile {
                path: self.mac_file_path.clone(),
                source,
            })?;

        let servers = parse_mac_file(&contents)?;
        debug!(path = %self.mac_file_path.display(), count = servers.len(), "mac file read");

        let count = servers.len();
        *self.servers.write().await = servers;
        Ok(count)
    }

    /// Resolves every listed MAC and builds the interest nodes. MACs no
    /// server owns are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the appliance fails to resolve a MAC.
    pub async fn resolve(&self) -> Result<NodeSet, Error> {
        let servers = self.servers.read().await.clone();
        let mut nodes = NodeSet::new();

        for server in servers {
            let resolved = self
                .lookup
                .server_hardware_for_mac(&server.mac_addr)
                .await
                .map_err(|e| Error::Lookup {
                    mac: server.mac_addr.clone(),
                    source: Box::new(e),
                })?;

            let Some(uuid) = resolved else {
                debug!(mac = %server.mac_addr, "no server hardware owns mac");
                continue;
            };

            let mut dimensions = server.string_dimensions();
            dimensions.insert("server_hardware_uuid".to_string(), uuid.to_string());

            nodes.insert(Node::new(
                uuid,
                MetricSet::from([MetricDescriptor::new(METRIC_NAME, dimensions)]),
            ));
        }

        Ok(nodes)
    }
}

#[async_trait]
impl<L> InterestProbe for ServerListProbe<L>
where
    L: ServerHardwareLookup,
{
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn prepare(&self) -> Result<(), DriverError> {
        info!(path = %self.mac_file_path.display(), "initializing server list discovery");
        self.load_mac_file().await?;
        Ok(())
    }

    async fn interest_nodes(&self) -> Result<NodeSet, DriverError> {
        Ok(self.resolve().await?)
    }
}

/// Builds the server list discovery source.
pub fn driver<L>(
    lookup: Arc<L>,
    mac_file_path: impl Into<PathBuf>,
    retry_interval: Duration,
) -> Arc<dyn DiscoverySource>
where
    L: ServerHardwareLookup,
{
    Arc::new(PolledDiscovery::new(PolledDiscoveryOptions {
        probe: Arc::new(ServerListProbe::new(lookup, mac_file_path)),
        retry_interval,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ovm_hardware_mock::{MockHardware, Operation};
    use ovm_model::ResourceId;
    use std::io::Write;

    const MAC_FILE: &str = r#"
servers:
  - mac-addr: "aa:aa:aa:aa:aa:01"
    dimensions:
      service: compute
      rack: 3
  - mac-addr: "aa:aa:aa:aa:aa:02"
    dimensions:
      service: compute
"#;

    fn mac_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_mac_file() {
        let servers = parse_mac_file(MAC_FILE).unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].mac_addr, "aa:aa:aa:aa:aa:01");
        assert_eq!(
            servers[0].string_dimensions(),
            BTreeMap::from([
                ("rack".to_string(), "3".to_string()),
                ("service".to_string(), "compute".to_string()),
            ])
        );
        assert!(parse_mac_file("").unwrap().is_empty());
        assert!(parse_mac_file("servers: []").unwrap().is_empty());
        assert_matches!(parse_mac_file("servers: 7"), Err(Error::ParseMacFile(_)));
    }

    #[tokio::test]
    async fn test_resolve_skips_unknown_macs() {
        let hardware = Arc::new(MockHardware::new());
        hardware.set_mac("aa:aa:aa:aa:aa:01", "sh-1");
        let file = mac_file(MAC_FILE);
        let probe = ServerListProbe::new(hardware, file.path());

        assert_eq!(probe.load_mac_file().await.unwrap(), 2);
        let nodes = probe.resolve().await.unwrap();

        assert_eq!(nodes.len(), 1);
        let node = nodes.iter().next().unwrap();
        assert_eq!(node.id, ResourceId::from("sh-1"));
        let metric = node.metrics.iter().next().unwrap();
        assert_eq!(metric.name, METRIC_NAME);
        assert_eq!(
            metric.dimensions.get("server_hardware_uuid").map(String::as_str),
            Some("sh-1")
        );
        assert_eq!(metric.dimensions.get("rack").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reported() {
        let hardware = Arc::new(MockHardware::new());
        hardware.fail_next(
            Operation::MacLookup,
            ovm_hardware_mock::Error::Unavailable("timeout".into()),
        );
        let file = mac_file(MAC_FILE);
        let probe = ServerListProbe::new(hardware, file.path());
        probe.load_mac_file().await.unwrap();

        assert_matches!(probe.resolve().await, Err(Error::Lookup { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_fails_prepare() {
        let probe = ServerListProbe::new(Arc::new(MockHardware::new()), "/nonexistent/macs.yml");

        assert!(probe.prepare().await.is_err());
    }
}
