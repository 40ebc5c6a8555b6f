use std::path::PathBuf;

use ovm_hardware::HardwareError;
use thiserror::Error;

/// The result type for appliance operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the appliance client.
#[derive(Debug, Error)]
pub enum Error {
    /// The appliance rejected the configured credentials.
    #[error("login failed: {0}")]
    Authentication(String),

    /// The session token is no longer accepted.
    #[error("appliance session expired")]
    SessionExpired,

    /// The appliance answered HTTP 400.
    #[error("appliance rejected the request (response: 400): {0}")]
    BadRequest(String),

    /// The requested resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The client certificate does not need regenerating.
    #[error("the existing certificate is still valid")]
    CertificateStillValid,

    /// Any other error response.
    #[error("appliance returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,

        /// Message reported by the appliance.
        message: String,
    },

    /// A status string is not a known health state.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    /// A server hardware document carried an unparseable timestamp.
    #[error(transparent)]
    Timestamp(#[from] ovm_model::Error),

    /// The configured CA bundle could not be loaded.
    #[error("cannot load CA bundle {path}: {source}")]
    CaBundle {
        /// Configured path.
        path: PathBuf,

        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Trust material could not be written to the certificate directory.
    #[error("cannot write {path}: {source}")]
    CertificateIo {
        /// File being written.
        path: PathBuf,

        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Whether a retry may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Authentication(_) | Self::CaBundle { .. } | Self::Url(_)
        )
    }
}

impl HardwareError for Error {
    fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    fn is_local_io(&self) -> bool {
        matches!(self, Self::CertificateIo { .. } | Self::CaBundle { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_write_failure_is_local_io() {
        let error = Error::CertificateIo {
            path: PathBuf::from("/var/lib/ovm/scmb/cert.pem"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };

        assert!(error.is_local_io());
        assert!(!error.is_authentication());
        assert!(!Error::SessionExpired.is_local_io());
    }
}
