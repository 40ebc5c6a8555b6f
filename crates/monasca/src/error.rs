use ovm_metrics_platform::MetricsPlatformError;
use thiserror::Error;

/// Errors returned by the Monasca client.
#[derive(Debug, Error)]
pub enum Error {
    /// Authentication or endpoint lookup failed.
    #[error(transparent)]
    Identity(#[from] ovm_keystone::Error),

    /// Transport failure while posting metrics.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed endpoint URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl MetricsPlatformError for Error {}
