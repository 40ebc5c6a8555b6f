//! Status poller: periodically asks the appliance for the status of every
//! monitored resource and forwards the results to its status subscribers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ovm_eventbus::{MonitoredSet, NodeSubscriber, StatusProvider, StatusSubscriber};
use ovm_hardware::HardwareStatusService;
use ovm_model::{CrashCallback, NodeSet, StatusRecord, StatusSet};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Name the poller registers under on the event bus.
pub const POLLER_NAME: &str = "puller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    NotStarted,
    Running,
    Stopped,
}

/// Options for creating a [`StatusPoller`].
pub struct StatusPollerOptions<H> {
    /// Appliance queried for statuses.
    pub hardware: Arc<H>,

    /// Period between polling passes.
    pub refresh_interval: Duration,

    /// Invoked with the failure of any polling pass.
    pub crash_callback: CrashCallback,
}

struct Shared<H> {
    hardware: Arc<H>,
    monitored: MonitoredSet,
    subscribers: StatusProvider,
    crash_callback: CrashCallback,
}

impl<H: HardwareStatusService> Shared<H> {
    async fn run_pass(&self) {
        if let Err(e) = self.process().await {
            error!(error = %e, "status polling failed");
            (self.crash_callback)(Box::new(e));
        }
    }

    async fn process(&self) -> Result<usize, Error> {
        let mut statuses = StatusSet::new();

        for id in self.monitored.snapshot() {
            let reported = self
                .hardware
                .get_status(&id)
                .await
                .map_err(|e| Error::Status {
                    id: id.clone(),
                    source: Box::new(e),
                })?;

            match reported {
                Some((code, modified_at)) => {
                    statuses.insert(StatusRecord::new(id, code, modified_at));
                }
                None => debug!(resource = %id, "no status reported"),
            }
        }

        if statuses.is_empty() {
            return Ok(0);
        }

        debug!(count = statuses.len(), "delivering polled statuses");
        self.subscribers
            .status_update(&statuses)
            .await
            .map_err(Error::Delivery)?;

        Ok(statuses.len())
    }
}

/// Low-priority bus subscriber that polls resource status directly from the
/// appliance.
pub struct StatusPoller<H>
where
    H: HardwareStatusService,
{
    cancellation_token: CancellationToken,
    first_iteration: AtomicBool,
    refresh_interval: Duration,
    shared: Arc<Shared<H>>,
    state: RwLock<ServiceState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<H> StatusPoller<H>
where
    H: HardwareStatusService,
{
    /// Creates a poller that monitors nothing yet.
    pub fn new(
        StatusPollerOptions {
            hardware,
            refresh_interval,
            crash_callback,
        }: StatusPollerOptions<H>,
    ) -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
            first_iteration: AtomicBool::new(true),
            refresh_interval,
            shared: Arc::new(Shared {
                hardware,
                monitored: MonitoredSet::new(),
                subscribers: StatusProvider::new(),
                crash_callback,
            }),
            state: RwLock::new(ServiceState::NotStarted),
            task: Mutex::new(None),
        }
    }

    /// Registers a status subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn StatusSubscriber>) {
        self.shared.subscribers.subscribe(subscriber);
    }

    /// Removes the status subscriber registered under `name`.
    pub fn unsubscribe(&self, name: &str) {
        self.shared.subscribers.unsubscribe(name);
    }

    /// Whether `id` is currently polled.
    #[must_use]
    pub fn is_monitored(&self, id: &ovm_model::ResourceId) -> bool {
        self.shared.monitored.contains(id)
    }

    /// Starts the polling loop. The first pass runs immediately.
    pub async fn publish(&self) {
        let mut state = self.state.write().await;
        if *state != ServiceState::NotStarted {
            debug!("poller already published");
            return;
        }

        info!(refresh_interval = ?self.refresh_interval, "starting status poller");

        let shared = self.shared.clone();
        let token = self.cancellation_token.clone();
        let period = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => shared.run_pass().await,
                }
            }
        });

        *self.task.lock().await = Some(handle);
        *state = ServiceState::Running;
    }

    /// Stops the polling loop after any in-flight pass. Safe to call when
    /// the loop never started.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if *state == ServiceState::Stopped {
            return;
        }

        self.cancellation_token.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "poller task failed");
        }

        *state = ServiceState::Stopped;
        info!("status poller stopped");
    }

    /// Runs one polling pass now, reporting failures through the crash
    /// callback.
    pub async fn poll_now(&self) {
        self.shared.run_pass().await;
    }
}

#[async_trait]
impl<H> NodeSubscriber for StatusPoller<H>
where
    H: HardwareStatusService,
{
    fn name(&self) -> &'static str {
        POLLER_NAME
    }

    async fn available(&self, nodes: &NodeSet) {
        self.shared.monitored.track(nodes);

        if self.first_iteration.swap(false, Ordering::SeqCst) {
            debug!("first discovery batch, polling immediately");
            self.shared.run_pass().await;
        }
    }

    async fn unavailable(&self, nodes: &NodeSet) {
        self.shared.monitored.untrack_empty(nodes);
    }
}
