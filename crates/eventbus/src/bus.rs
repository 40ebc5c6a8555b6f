use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ovm_model::{MetricSet, Node, NodeSet, ResourceId, merge_metrics, remove_metrics};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::driver::{DiscoverySource, DriverRegistry};
use crate::error::{Error, Result};
use crate::subscriber::{NodeSubscriber, Priority};

/// Pause between notifying the first and the second priority tier.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Options for creating an [`EventBus`].
pub struct EventBusOptions {
    /// Names of the discovery drivers to load on start, in order.
    pub drivers: Vec<String>,

    /// Factories the driver names are resolved against.
    pub registry: DriverRegistry,

    /// Pause between the two priority tiers once the first has finished.
    pub settle_delay: Duration,
}

impl Default for EventBusOptions {
    fn default() -> Self {
        Self {
            drivers: Vec::new(),
            registry: DriverRegistry::new(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

#[derive(Default)]
struct Tiers {
    high: Vec<Arc<dyn NodeSubscriber>>,
    low: Vec<Arc<dyn NodeSubscriber>>,
}

impl Tiers {
    const fn get(&self, priority: Priority) -> &Vec<Arc<dyn NodeSubscriber>> {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }

    const fn get_mut(&mut self, priority: Priority) -> &mut Vec<Arc<dyn NodeSubscriber>> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }
}

fn same_subscriber(a: &Arc<dyn NodeSubscriber>, b: &Arc<dyn NodeSubscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Process-wide hub for resource availability.
///
/// Keeps the merged metric set of every resource reported by the loaded
/// discovery sources and re-publishes changes to subscribers. On
/// `available` the high tier is notified and awaited before the low tier;
/// on `unavailable` the order is reversed. The two tiers are separated by a
/// settle delay.
pub struct EventBus {
    driver_names: Vec<String>,
    registry: DriverRegistry,
    settle_delay: Duration,
    drivers: Mutex<HashMap<String, Arc<dyn DiscoverySource>>>,
    subscribers: RwLock<Tiers>,
    events: Mutex<HashMap<ResourceId, Node>>,
}

impl EventBus {
    /// Creates a bus. No driver is loaded until [`EventBus::start`].
    #[must_use]
    pub fn new(
        EventBusOptions {
            drivers,
            registry,
            settle_delay,
        }: EventBusOptions,
    ) -> Self {
        Self {
            driver_names: drivers,
            registry,
            settle_delay,
            drivers: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Tiers::default()),
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Loads every configured driver, subscribes the bus to it and starts its
    /// discovery. Names with no registered factory are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Driver`] if a driver fails to build or to start.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener: Arc<dyn NodeSubscriber> = Arc::new(BusListener {
            bus: Arc::downgrade(self),
        });

        for name in &self.driver_names {
            if self.drivers.lock().await.contains_key(name) {
                continue;
            }

            info!(driver = %name, "loading discovery driver");

            let Some(built) = self.registry.build(name) else {
                info!(driver = %name, "discovery driver not found, skipping");
                continue;
            };

            let source = built.map_err(|source| {
                error!(driver = %name, error = %source, "failed to build discovery driver");
                Error::Driver {
                    name: name.clone(),
                    source,
                }
            })?;

            source.subscribe(listener.clone());
            self.drivers
                .lock()
                .await
                .insert(name.clone(), source.clone());

            source.discover().await.map_err(|source| {
                error!(driver = %name, error = %source, "discovery driver failed to start");
                Error::Driver {
                    name: name.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }

    /// Stops every loaded driver and forgets all drivers, subscribers and
    /// resources. Driver failures are logged.
    pub async fn stop(&self) {
        let drivers: Vec<_> = self.drivers.lock().await.drain().collect();

        for (name, driver) in drivers {
            if let Err(e) = driver.stop().await {
                error!(driver = %name, error = %e, "failed to stop discovery driver");
            }
        }

        *self.subscribers.write().await = Tiers::default();
        self.events.lock().await.clear();

        info!("event bus stopped");
    }

    /// Registers `subscriber` in the `priority` tier. If resources are
    /// already known they are delivered to it at once.
    pub async fn subscribe(&self, subscriber: Arc<dyn NodeSubscriber>, priority: Priority) {
        info!(subscriber = subscriber.name(), %priority, "subscribing to event bus");

        {
            let mut tiers = self.subscribers.write().await;
            let tier = tiers.get_mut(priority);
            if !tier.iter().any(|s| same_subscriber(s, &subscriber)) {
                tier.push(subscriber.clone());
            }
        }

        let known: NodeSet = self.events.lock().await.values().cloned().collect();
        if !known.is_empty() {
            debug!(subscriber = subscriber.name(), count = known.len(), "delivering known resources");
            subscriber.available(&known).await;
        }
    }

    /// Removes `subscriber` from whichever tier holds it.
    pub async fn unsubscribe(&self, subscriber: &Arc<dyn NodeSubscriber>) {
        let mut tiers = self.subscribers.write().await;
        tiers.high.retain(|s| !same_subscriber(s, subscriber));
        tiers.low.retain(|s| !same_subscriber(s, subscriber));
    }

    /// Merges the metrics of `nodes` into the stored resources and, if any
    /// resource was touched, notifies the high tier, waits, then notifies
    /// the low tier with the merged records.
    pub async fn available(&self, nodes: &NodeSet) {
        let updated: NodeSet = {
            let mut events = self.events.lock().await;
            let mut touched = BTreeSet::new();

            for node in nodes {
                let stored = events
                    .entry(node.id.clone())
                    .or_insert_with(|| Node::new(node.id.clone(), MetricSet::new()));
                merge_metrics(&mut stored.metrics, &node.metrics);
                touched.insert(node.id.clone());
            }

            touched
                .iter()
                .filter_map(|id| events.get(id).cloned())
                .collect()
        };

        if updated.is_empty() {
            return;
        }

        self.notify_available(Priority::High, &updated).await;
        tokio::time::sleep(self.settle_delay).await;
        self.notify_available(Priority::Low, &updated).await;
    }

    /// Removes the metrics of `nodes` from the stored resources, then
    /// notifies the low tier, waits, and notifies the high tier. Resources
    /// stay known even when no metric is left, and subscribers are notified
    /// even if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResource`] without touching any state if one
    /// of the nodes was never made available.
    pub async fn unavailable(&self, nodes: &NodeSet) -> Result<()> {
        let updated: NodeSet = {
            let mut events = self.events.lock().await;

            if let Some(unknown) = nodes.iter().find(|node| !events.contains_key(&node.id)) {
                return Err(Error::UnknownResource(unknown.id.clone()));
            }

            let mut touched = BTreeSet::new();
            for node in nodes {
                if let Some(stored) = events.get_mut(&node.id) {
                    remove_metrics(&mut stored.metrics, &node.metrics);
                    touched.insert(node.id.clone());
                }
            }

            touched
                .iter()
                .filter_map(|id| events.get(id).cloned())
                .collect()
        };

        self.notify_unavailable(Priority::Low, &updated).await;
        tokio::time::sleep(self.settle_delay).await;
        self.notify_unavailable(Priority::High, &updated).await;

        Ok(())
    }

    /// Number of subscribers in one tier, or in both when `priority` is
    /// `None`.
    pub async fn length_subscribers(&self, priority: Option<Priority>) -> usize {
        let tiers = self.subscribers.read().await;
        priority.map_or_else(
            || tiers.high.len() + tiers.low.len(),
            |priority| tiers.get(priority).len(),
        )
    }

    /// Current merged record for `id`.
    pub async fn resource(&self, id: &ResourceId) -> Option<Node> {
        self.events.lock().await.get(id).cloned()
    }

    async fn tier(&self, priority: Priority) -> Vec<Arc<dyn NodeSubscriber>> {
        self.subscribers.read().await.get(priority).clone()
    }

    async fn notify_available(&self, priority: Priority, nodes: &NodeSet) {
        for subscriber in self.tier(priority).await {
            debug!(subscriber = subscriber.name(), %priority, count = nodes.len(), "notifying available");
            subscriber.available(nodes).await;
        }
    }

    async fn notify_unavailable(&self, priority: Priority, nodes: &NodeSet) {
        for subscriber in self.tier(priority).await {
            debug!(subscriber = subscriber.name(), %priority, count = nodes.len(), "notifying unavailable");
            subscriber.unavailable(nodes).await;
        }
    }
}

/// Listener handed to discovery drivers. Holds the bus weakly so that the
/// drivers the bus owns do not keep it alive.
struct BusListener {
    bus: Weak<EventBus>,
}

#[async_trait]
impl NodeSubscriber for BusListener {
    fn name(&self) -> &'static str {
        "eventbus"
    }

    async fn available(&self, nodes: &NodeSet) {
        if let Some(bus) = self.bus.upgrade() {
            bus.available(nodes).await;
        }
    }

    async fn unavailable(&self, nodes: &NodeSet) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };

        if let Err(e) = bus.unavailable(nodes).await {
            warn!(error = %e, "discovery driver withdrew an unknown resource");
        }
    }
}
