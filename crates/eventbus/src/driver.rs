use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::subscriber::NodeSubscriber;

/// Error returned by a discovery driver.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Builds a discovery source on demand.
pub type DriverFactory =
    Box<dyn Fn() -> Result<Arc<dyn DiscoverySource>, DriverError> + Send + Sync>;

/// A source of resource availability, e.g. a MAC list file or an
/// orchestrator's node inventory.
#[async_trait]
pub trait DiscoverySource: Send + Sync + 'static {
    /// Begins discovering resources and publishing them to listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery cannot begin.
    async fn discover(&self) -> Result<(), DriverError>;

    /// Stops discovery. In-flight work completes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the source failed while shutting down.
    async fn stop(&self) -> Result<(), DriverError>;

    /// Registers a listener for availability changes.
    fn subscribe(&self, listener: Arc<dyn NodeSubscriber>);
}

/// Name to factory mapping used to resolve configured discovery drivers.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn DiscoverySource>, DriverError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Whether a factory exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the driver registered under `name`.
    ///
    /// Returns `None` if no factory is registered.
    #[must_use]
    pub fn build(&self, name: &str) -> Option<Result<Arc<dyn DiscoverySource>, DriverError>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
