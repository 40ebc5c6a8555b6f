use ovm_eventbus::SubscriberError;
use ovm_model::ResourceId;
use thiserror::Error;

/// Errors raised by a push channel implementation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The broker rejected the client certificate.
    #[error("broker authentication failed: {0}")]
    Authentication(String),

    /// Local I/O failure, such as writing trust material to disk.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The connection or channel to the broker failed.
    #[error("broker transport failure: {0}")]
    Transport(String),

    /// Any other broker failure.
    #[error("broker failure: {0}")]
    Other(String),
}

/// How the reconnect loop reacts to a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FailureKind {
    Fatal,
    Transport,
    Other,
}

/// Errors raised by the push listener.
#[derive(Debug, Error)]
pub enum Error {
    /// Trust material could not be obtained, validated or stored.
    #[error("failed to obtain broker trust material: {source}")]
    TrustMaterial {
        /// Whether the appliance rejected our credentials.
        authentication: bool,

        /// Whether storing the material locally failed.
        local_io: bool,

        /// Appliance error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The broker session failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The reconnect budget ran out.
    #[error("failed to open a connection with the message bus, fix it and try again")]
    ConnectionPermanentlyFailed,

    /// A status string in a message could not be mapped.
    #[error("failed to map status of {id}: {source}")]
    StatusMapping {
        /// Resource named in the message.
        id: ResourceId,

        /// Mapping error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The modification timestamp in a message could not be parsed.
    #[error(transparent)]
    Timestamp(#[from] ovm_model::Error),

    /// A status subscriber rejected a pushed status.
    #[error("failed to deliver pushed status: {0}")]
    Delivery(#[source] SubscriberError),
}

impl Error {
    pub(crate) const fn kind(&self) -> FailureKind {
        match self {
            Self::TrustMaterial {
                authentication: true,
                ..
            }
            | Self::TrustMaterial { local_io: true, .. }
            | Self::Channel(ChannelError::Authentication(_) | ChannelError::Io(_)) => {
                FailureKind::Fatal
            }
            Self::Channel(ChannelError::Transport(_)) => FailureKind::Transport,
            _ => FailureKind::Other,
        }
    }
}
