//! Abstract interface to the hardware-management appliance that reports the
//! health of server hardware.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ovm_model::{AlertMeta, ResourceId, StatusCode};

/// Marker trait for `HardwareStatusService` errors.
pub trait HardwareError: Debug + Error + Send + Sync + 'static {
    /// Whether the appliance rejected the configured credentials. These
    /// failures are never retried.
    fn is_authentication(&self) -> bool;

    /// Whether a local file operation failed, such as storing trust
    /// material. These failures are never retried either.
    fn is_local_io(&self) -> bool {
        false
    }
}

/// Client credentials and CA used to open the push-notification channel.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrustMaterial {
    /// PEM-encoded CA certificate of the broker.
    pub ca_certificate: String,

    /// PEM-encoded client certificate.
    pub client_certificate: String,

    /// PEM-encoded client private key.
    pub client_key: String,
}

/// Status, alert and trust-material queries against the appliance.
#[async_trait]
pub trait HardwareStatusService: Send + Sync + 'static {
    /// The error type for appliance operations.
    type Error: HardwareError;

    /// Current status of a resource and when it was last modified.
    ///
    /// Returns `Ok(None)` if the appliance does not know the resource.
    async fn get_status(
        &self,
        id: &ResourceId,
    ) -> Result<Option<(StatusCode, DateTime<Utc>)>, Self::Error>;

    /// Maps an appliance status string to its status code.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a known status.
    fn get_status_for_code(&self, name: &str) -> Result<StatusCode, Self::Error>;

    /// Active alerts for a resource, keyed by alert URI. Empty when the
    /// status is OK.
    async fn get_alerts(&self, id: &ResourceId, status: StatusCode)
    -> Result<AlertMeta, Self::Error>;

    /// Retrieves the broker CA and the client key pair.
    async fn get_trust_material(&self) -> Result<TrustMaterial, Self::Error>;

    /// Ensures the client certificate exists and is still valid,
    /// regenerating it if needed.
    async fn validate_trust_material(&self) -> Result<(), Self::Error>;
}

/// Resolves a network interface MAC address to the server hardware that
/// owns it.
#[async_trait]
pub trait ServerHardwareLookup: Send + Sync + 'static {
    /// The error type for lookups.
    type Error: HardwareError;

    /// The server hardware owning `mac`, or `None` if no server has it.
    async fn server_hardware_for_mac(&self, mac: &str) -> Result<Option<ResourceId>, Self::Error>;
}
