use ovm_model::ResourceId;
use thiserror::Error;

use crate::driver::DriverError;

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the event bus.
#[derive(Debug, Error)]
pub enum Error {
    /// A discovery driver failed to build or to start discovering.
    #[error("discovery driver '{name}' failed: {source}")]
    Driver {
        /// Registered name of the driver.
        name: String,

        /// Underlying failure.
        #[source]
        source: DriverError,
    },

    /// Metrics were withdrawn for a resource the bus has never seen.
    #[error("resource {0} was never made available")]
    UnknownResource(ResourceId),
}
