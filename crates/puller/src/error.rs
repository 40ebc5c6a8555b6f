use ovm_eventbus::SubscriberError;
use ovm_model::ResourceId;
use thiserror::Error;

/// Errors raised by a polling pass. Every one of them is reported through
/// the crash callback.
#[derive(Debug, Error)]
pub enum Error {
    /// The appliance could not report the status of a resource.
    #[error("failed to get status of {id}: {source}")]
    Status {
        /// Resource being polled.
        id: ResourceId,

        /// Appliance error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A status subscriber rejected the polled statuses.
    #[error("failed to deliver statuses: {0}")]
    Delivery(#[source] SubscriberError),
}
