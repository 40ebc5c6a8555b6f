use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Default certificate directory for the message bus trust material.
pub const DEFAULT_CERTIFICATE_DIR: &str = "/var/run/oneview-monasca";

/// Default election group.
pub const DEFAULT_GROUP_NAME: &str = "oneview-monasca";

const SAMPLE_AUTH_URL: &str = "http://127.0.0.1:5000/v3";
const SAMPLE_NATS_URL: &str = "nats://127.0.0.1:4222";
const SAMPLE_MAC_FILE: &str = "/etc/oneview-monasca/macs.yml";

/// Complete agent configuration, read from a TOML file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Agent behaviour.
    pub agent: AgentSection,

    /// Active/passive coordination. Absent means a single instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination: Option<CoordinationSection>,

    /// OpenStack identity credentials.
    pub openstack: OpenStackSection,

    /// Appliance credentials.
    pub oneview: OneViewSection,

    /// Settings of the `serverlist` discovery driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverlist: Option<ServerListSection>,

    /// Settings of the `ironic` discovery driver.
    #[serde(default)]
    pub ironic: IronicSection,
}

/// `[agent]`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// Log at debug level.
    #[serde(default)]
    pub debug: bool,

    /// Seconds between two discovery probes.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Seconds between two status polling passes.
    #[serde(default = "default_refresh_interval")]
    pub periodic_refresh_interval: u64,

    /// Seconds between two batch re-emissions.
    #[serde(default = "default_batch_interval")]
    pub batch_publishing_interval: u64,

    /// Attempts per remote call, and reconnection budget of the push
    /// listener.
    #[serde(default = "default_auth_retry_limit")]
    pub auth_retry_limit: u32,

    /// Directory the message bus trust material is written to.
    #[serde(default = "default_certificate_dir")]
    pub scmb_certificate_dir: PathBuf,

    /// Discovery drivers to load, by name.
    pub drivers: Vec<String>,
}

/// `[coordination]`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinationSection {
    /// NATS server hosting the election buckets.
    pub nats_url: String,

    /// Election group shared by every agent of the fleet.
    #[serde(default = "default_group_name")]
    pub group_name: String,
}

/// `[openstack]`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OpenStackSection {
    /// Identity service URL.
    pub auth_url: Url,

    /// User name.
    pub auth_user: String,

    /// Password.
    pub auth_password: String,

    /// Project the token is scoped to.
    pub auth_tenant_name: String,

    /// Skip TLS verification towards OpenStack services.
    #[serde(default)]
    pub insecure: bool,
}

/// `[oneview]`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OneViewSection {
    /// Appliance address.
    pub host: String,

    /// User name.
    pub username: String,

    /// Password.
    pub password: String,

    /// Skip TLS verification towards the appliance.
    #[serde(default)]
    pub allow_insecure_connections: bool,

    /// Extra CA bundle trusted for the appliance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cacert_file: Option<PathBuf>,
}

/// `[serverlist]`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerListSection {
    /// YAML file listing the MAC addresses to monitor.
    pub mac_file_path: PathBuf,
}

/// `[ironic]`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IronicSection {
    /// Bare metal API microversion.
    #[serde(default = "default_ironic_api_version")]
    pub api_version: String,

    /// Skip TLS verification towards the bare metal API.
    #[serde(default)]
    pub insecure: bool,
}

impl Default for IronicSection {
    fn default() -> Self {
        Self {
            api_version: default_ironic_api_version(),
            insecure: false,
        }
    }
}

const fn default_retry_interval() -> u64 {
    300
}

const fn default_refresh_interval() -> u64 {
    180
}

const fn default_batch_interval() -> u64 {
    60
}

const fn default_auth_retry_limit() -> u32 {
    5
}

fn default_certificate_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CERTIFICATE_DIR)
}

fn default_group_name() -> String {
    DEFAULT_GROUP_NAME.to_string()
}

fn default_ironic_api_version() -> String {
    "1.22".to_string()
}

impl AgentSection {
    /// Period of the discovery drivers.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    /// Period of the status poller.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_refresh_interval)
    }

    /// Period of the aggregator batch.
    #[must_use]
    pub const fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_publishing_interval)
    }
}

impl AgentConfig {
    /// Starting configuration with every tunable at its default and
    /// placeholder credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the placeholder identity URL does not parse.
    pub fn sample() -> Result<Self> {
        let auth_url =
            Url::parse(SAMPLE_AUTH_URL).map_err(|e| Error::InvalidConfig(e.to_string()))?;

        Ok(Self {
            agent: AgentSection {
                debug: false,
                retry_interval: default_retry_interval(),
                periodic_refresh_interval: default_refresh_interval(),
                batch_publishing_interval: default_batch_interval(),
                auth_retry_limit: default_auth_retry_limit(),
                scmb_certificate_dir: default_certificate_dir(),
                drivers: vec![ovm_discovery_serverlist::DRIVER_NAME.to_string()],
            },
            coordination: Some(CoordinationSection {
                nats_url: SAMPLE_NATS_URL.to_string(),
                group_name: default_group_name(),
            }),
            openstack: OpenStackSection {
                auth_url,
                auth_user: "admin".to_string(),
                auth_password: "changeme".to_string(),
                auth_tenant_name: "admin".to_string(),
                insecure: false,
            },
            oneview: OneViewSection {
                host: "oneview.example.com".to_string(),
                username: "administrator".to_string(),
                password: "changeme".to_string(),
                allow_insecure_connections: false,
                tls_cacert_file: None,
            },
            serverlist: Some(ServerListSection {
                mac_file_path: PathBuf::from(SAMPLE_MAC_FILE),
            }),
            ironic: IronicSection::default(),
        })
    }

    /// Renders the configuration as a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if a value has no TOML representation.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings no type can express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let agent = &self.agent;

        for (name, value) in [
            ("retry_interval", agent.retry_interval),
            ("periodic_refresh_interval", agent.periodic_refresh_interval),
            ("batch_publishing_interval", agent.batch_publishing_interval),
            ("auth_retry_limit", u64::from(agent.auth_retry_limit)),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!(
                    "agent.{name} must be a positive integer"
                )));
            }
        }

        if agent.drivers.is_empty() {
            return Err(Error::InvalidConfig(
                "agent.drivers must name at least one discovery driver".to_string(),
            ));
        }

        if self.oneview.host.trim().is_empty() {
            return Err(Error::InvalidConfig("oneview.host is empty".to_string()));
        }

        if !matches!(self.openstack.auth_url.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "openstack.auth_url must be an http(s) URL, got {}",
                self.openstack.auth_url
            )));
        }

        if agent.drivers.iter().any(|d| d == ovm_discovery_serverlist::DRIVER_NAME)
            && self.serverlist.is_none()
        {
            return Err(Error::InvalidConfig(
                "the serverlist driver needs a [serverlist] section".to_string(),
            ));
        }

        Ok(())
    }
}
