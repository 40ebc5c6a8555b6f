use thiserror::Error;

/// Errors raised by the ironic inventory.
#[derive(Debug, Error)]
pub enum Error {
    /// Authentication or endpoint lookup failed.
    #[error(transparent)]
    Identity(#[from] ovm_keystone::Error),

    /// The bare metal API rejected the token.
    #[error("bare metal API rejected the credentials")]
    Unauthorized,

    /// The bare metal API answered with an unexpected status.
    #[error("bare metal API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,

        /// Response body.
        body: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed endpoint URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Whether the failure is a credentials rejection, never retried.
    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Identity(ovm_keystone::Error::Unauthorized)
        )
    }
}
