//! In-process event bus that merges resource availability reported by
//! discovery sources and fans it out to subscribers in two priority tiers.
//!
//! The crate also holds the subscription contracts shared by the pipeline
//! components: [`NodeSubscriber`] for availability events and
//! [`StatusSubscriber`] for status updates, along with the small provider
//! helpers producers embed to fan out to their own listeners, and
//! [`PolledDiscovery`], the periodic diffing loop discovery drivers run on.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bus;
mod driver;
mod error;
mod monitored;
mod polled;
mod provider;
mod subscriber;

pub use bus::{DEFAULT_SETTLE_DELAY, EventBus, EventBusOptions};
pub use driver::{DiscoverySource, DriverError, DriverFactory, DriverRegistry};
pub use error::{Error, Result};
pub use monitored::MonitoredSet;
pub use polled::{InterestProbe, PolledDiscovery, PolledDiscoveryOptions};
pub use provider::{NodeProvider, StatusProvider};
pub use subscriber::{NodeSubscriber, Priority, StatusSubscriber, SubscriberError};
