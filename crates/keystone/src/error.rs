use thiserror::Error;

/// The result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the identity client.
#[derive(Debug, Error)]
pub enum Error {
    /// The identity service rejected the credentials.
    #[error("identity service rejected the credentials")]
    Unauthorized,

    /// The identity service answered with an unexpected status.
    #[error("identity service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,

        /// Response body.
        body: String,
    },

    /// The token response carried no `X-Subject-Token` header.
    #[error("identity service returned no token")]
    MissingToken,

    /// The catalog has no endpoint of the requested type.
    #[error("no {interface} endpoint for service type '{service_type}'")]
    EndpointNotFound {
        /// Service type searched for.
        service_type: String,

        /// Endpoint interface searched for.
        interface: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}
