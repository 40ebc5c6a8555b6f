use ovm_model::ResourceId;
use thiserror::Error;

/// Result type for aggregator operations.
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the aggregator.
#[derive(Debug, Error)]
pub enum Error {
    /// Alert metadata could not be fetched from the appliance.
    #[error("failed to fetch alerts for {id}: {source}")]
    Alerts {
        /// Resource whose alerts were requested.
        id: ResourceId,

        /// Appliance error.
        #[source]
        source: BoxError,
    },

    /// The metrics platform rejected or did not receive the batch.
    #[error("failed to submit measurements: {0}")]
    Submit(#[source] BoxError),
}
