use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovm_model::NodeSet;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::driver::{DiscoverySource, DriverError};
use crate::provider::NodeProvider;
use crate::subscriber::NodeSubscriber;

/// Computes the current set of interest nodes for a [`PolledDiscovery`].
#[async_trait]
pub trait InterestProbe: Send + Sync + 'static {
    /// Driver name used in logs.
    fn name(&self) -> &str;

    /// One-off initialisation run when discovery starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be used. The driver then does
    /// not start.
    async fn prepare(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// The nodes currently of interest.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing inventory cannot be read. The driver
    /// then stops.
    async fn interest_nodes(&self) -> Result<NodeSet, DriverError>;
}

/// Options for creating a [`PolledDiscovery`].
pub struct PolledDiscoveryOptions<P> {
    /// Source of interest nodes.
    pub probe: Arc<P>,

    /// Period between two probes.
    pub retry_interval: Duration,
}

struct Poller<P> {
    probe: Arc<P>,
    listeners: NodeProvider,
    interest: Mutex<NodeSet>,
}

impl<P: InterestProbe> Poller<P> {
    /// Probes once and publishes the difference with the previous probe.
    /// Withdrawals go out before additions so a changed node is replaced,
    /// not erased.
    async fn pull(&self) -> Result<(), DriverError> {
        debug!(driver = self.probe.name(), "pulling interest nodes");
        let current = self.probe.interest_nodes().await?;
        info!(driver = self.probe.name(), count = current.len(), "interest nodes taken");

        let (added, removed) = {
            let mut interest = self.interest.lock().await;
            let added: NodeSet = current.difference(&interest).cloned().collect();
            let removed: NodeSet = interest.difference(&current).cloned().collect();
            *interest = current;
            (added, removed)
        };

        if !removed.is_empty() {
            self.listeners.unavailable(&removed).await;
        }
        if !added.is_empty() {
            self.listeners.available(&added).await;
        }

        Ok(())
    }
}

/// Discovery source that periodically probes an inventory and publishes
/// the nodes that appeared or disappeared since the previous probe.
pub struct PolledDiscovery<P>
where
    P: InterestProbe,
{
    cancellation_token: CancellationToken,
    poller: Arc<Poller<P>>,
    retry_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P> PolledDiscovery<P>
where
    P: InterestProbe,
{
    /// Creates an idle source.
    pub fn new(
        PolledDiscoveryOptions {
            probe,
            retry_interval,
        }: PolledDiscoveryOptions<P>,
    ) -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
            poller: Arc::new(Poller {
                probe,
                listeners: NodeProvider::new(),
                interest: Mutex::new(NodeSet::new()),
            }),
            retry_interval,
            task: Mutex::new(None),
        }
    }

    /// Whether the polling loop is running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Nodes published by the last successful probe.
    pub async fn interest(&self) -> NodeSet {
        self.poller.interest.lock().await.clone()
    }
}

#[async_trait]
impl<P> DiscoverySource for PolledDiscovery<P>
where
    P: InterestProbe,
{
    async fn discover(&self) -> Result<(), DriverError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let name = self.poller.probe.name().to_string();
        info!(driver = %name, "initializing discovery driver");

        if let Err(e) = self.poller.probe.prepare().await {
            error!(driver = %name, error = %e, "cannot start discovery driver");
            return Ok(());
        }

        let poller = self.poller.clone();
        let token = self.cancellation_token.clone();
        let period = self.retry_interval;

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = poller.pull().await {
                            error!(driver = %name, error = %e, "discovery driver stopped");
                            break;
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.cancellation_token.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            handle.await?;
        }

        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn NodeSubscriber>) {
        self.poller.listeners.subscribe(listener);
    }
}
