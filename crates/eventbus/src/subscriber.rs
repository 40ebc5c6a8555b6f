use std::fmt;

use async_trait::async_trait;
use ovm_model::{NodeSet, StatusSet};

/// Error a status subscriber hands back to the producer that called it.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Delivery tier on the event bus.
///
/// `High` is for consumers that must see a resource before producers start
/// sourcing data for it; `Low` is for producers and pass-through components.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Priority {
    /// Notified first on `available`, last on `unavailable`.
    High,

    /// Notified last on `available`, first on `unavailable`.
    #[default]
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Low => f.write_str("low"),
        }
    }
}

/// Receives resource availability changes.
///
/// Callbacks never fail: a subscriber that needs to escalate a failure does
/// so through its own crash callback.
#[async_trait]
pub trait NodeSubscriber: Send + Sync + 'static {
    /// Name used in logs and for keyed registration.
    fn name(&self) -> &str;

    /// Resources became available, or gained metrics.
    async fn available(&self, nodes: &NodeSet);

    /// Resources lost metrics. A node with an empty metric set is gone.
    async fn unavailable(&self, nodes: &NodeSet);
}

/// Receives status updates from a producer.
#[async_trait]
pub trait StatusSubscriber: Send + Sync + 'static {
    /// Name used in logs and for keyed registration.
    fn name(&self) -> &str;

    /// New status records are available.
    ///
    /// # Errors
    ///
    /// Returns an error if the update could not be forwarded downstream.
    async fn status_update(&self, statuses: &StatusSet) -> Result<(), SubscriberError>;
}
