use async_trait::async_trait;
use bytes::Bytes;
use ovm_hardware::TrustMaterial;

use crate::ChannelError;

/// TLS port of the appliance message broker.
pub const BROKER_PORT: u16 = 5671;

/// Exchange carrying state-change messages.
pub const EXCHANGE_NAME: &str = "scmb";

/// Routing key for server hardware update messages.
pub const ROUTING_KEY: &str = "scmb.server-hardware.Updated.#";

/// Where and how to reach the broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrokerEndpoint {
    /// Broker host, the appliance address.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Exchange to bind the session queue to.
    pub exchange: String,

    /// Routing key used for the binding.
    pub routing_key: String,
}

impl BrokerEndpoint {
    /// Endpoint for the state-change message bus of `host`.
    #[must_use]
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: BROKER_PORT,
            exchange: EXCHANGE_NAME.to_string(),
            routing_key: ROUTING_KEY.to_string(),
        }
    }
}

/// A message received from the broker.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Routing key the message was published with.
    pub routing_key: String,

    /// Raw message body.
    pub body: Bytes,
}

/// Opens authenticated sessions to the broker.
#[async_trait]
pub trait PushChannel: Send + Sync + 'static {
    /// Opens an encrypted session using client-certificate authentication.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        trust_material: &TrustMaterial,
    ) -> Result<Box<dyn PushSession>, ChannelError>;
}

/// An open broker session.
#[async_trait]
pub trait PushSession: Send + 'static {
    /// Declares an exclusive queue, binds it to `exchange` with
    /// `routing_key` and starts consuming from it.
    async fn bind_and_consume(
        &mut self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError>;

    /// Waits for the next message. `Ok(None)` means the broker closed the
    /// session.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, ChannelError>;

    /// Closes the session.
    async fn close(&mut self);
}
