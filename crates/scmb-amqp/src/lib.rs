//! AMQP push channel: opens TLS sessions to the appliance message broker,
//! authenticating with the client certificate through the `EXTERNAL` SASL
//! mechanism.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use ovm_hardware::TrustMaterial;
use ovm_scmb::{BrokerEndpoint, ChannelError, Delivery, PushChannel, PushSession};
use tracing::{debug, info};

const REPLY_SUCCESS: u16 = 200;

/// Tag announced for the session consumer.
pub const CONSUMER_TAG: &str = "ovm-agent";

/// Push channel speaking AMQP 0-9-1 over TLS.
#[derive(Clone, Debug, Default)]
pub struct AmqpPushChannel;

impl AmqpPushChannel {
    /// Creates a channel. Connections are opened on the current Tokio
    /// runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Connection URI for `endpoint`, selecting certificate authentication on the
/// default virtual host.
#[must_use]
pub fn broker_uri(endpoint: &BrokerEndpoint) -> String {
    format!(
        "amqps://{}:{}/%2f?auth_mechanism=external",
        endpoint.host, endpoint.port
    )
}

/// TLS settings presenting the client key pair and trusting only the broker
/// CA.
#[must_use]
pub fn tls_config(trust_material: &TrustMaterial) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: Some(OwnedIdentity::PKCS8 {
            pem: trust_material.client_certificate.clone().into_bytes(),
            key: trust_material.client_key.clone().into_bytes(),
        }),
        cert_chain: Some(trust_material.ca_certificate.clone()),
    }
}

/// Maps a broker client error onto the reconnect policy of the listener.
#[must_use]
pub fn classify(error: &lapin::Error) -> ChannelError {
    let message = error.to_string();

    match error {
        lapin::Error::ProtocolError(_) if message.contains("ACCESS_REFUSED") => {
            ChannelError::Authentication(message)
        }
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => ChannelError::Transport(message),
        _ => ChannelError::Other(message),
    }
}

fn properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

#[async_trait]
impl PushChannel for AmqpPushChannel {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        trust_material: &TrustMaterial,
    ) -> Result<Box<dyn PushSession>, ChannelError> {
        info!(host = %endpoint.host, port = endpoint.port, "connecting to the message bus");

        let connection = Connection::connect_with_config(
            &broker_uri(endpoint),
            properties(),
            tls_config(trust_material),
        )
        .await
        .map_err(|e| classify(&e))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.close(REPLY_SUCCESS, "OK").await {
                    debug!(error = %close_error, "failed to close connection");
                }
                return Err(classify(&e));
            }
        };

        Ok(Box::new(AmqpPushSession {
            connection,
            channel,
            consumer: None,
        }))
    }
}

/// Session opened by [`AmqpPushChannel`].
pub struct AmqpPushSession {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

#[async_trait]
impl PushSession for AmqpPushSession {
    async fn bind_and_consume(
        &mut self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;
        let queue_name = queue.name().as_str();

        self.channel
            .queue_bind(
                queue_name,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;

        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;

        debug!(queue = queue_name, exchange, routing_key, "queue bound");
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, ChannelError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(ChannelError::Other("not consuming".to_string()));
        };

        match consumer.next().await {
            None => Ok(None),
            Some(Ok(delivery)) => Ok(Some(Delivery {
                routing_key: delivery.routing_key.as_str().to_string(),
                body: Bytes::from(delivery.data),
            })),
            Some(Err(e)) => Err(classify(&e)),
        }
    }

    async fn close(&mut self) {
        self.consumer.take();

        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "failed to close channel");
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "failed to close connection");
        }
    }
}
