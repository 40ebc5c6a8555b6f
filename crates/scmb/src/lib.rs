//! Push listener: consumes server hardware state-change messages from the
//! appliance message broker and forwards the statuses of monitored resources
//! to its status subscribers.
//!
//! The broker transport sits behind [`PushChannel`]. The listener owns the
//! reconnect policy. Authentication failures and failures to store trust
//! material locally are fatal. The first transport failure after a
//! successful consume start retries for free with freshly loaded
//! certificates. Every other failure spends one unit of the retry budget.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod channel;
mod error;
mod message;

pub use channel::{
    BROKER_PORT, BrokerEndpoint, Delivery, EXCHANGE_NAME, PushChannel, PushSession, ROUTING_KEY,
};
pub use error::{ChannelError, Error};
pub use message::{ResourceChange, parse as parse_message};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error::FailureKind;
use ovm_eventbus::{MonitoredSet, NodeSubscriber, StatusProvider, StatusSubscriber};
use ovm_hardware::{HardwareError, HardwareStatusService};
use ovm_model::{CrashCallback, NodeSet, ResourceId, StatusRecord, StatusSet, parse_timestamp};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name the listener registers under on the event bus.
pub const LISTENER_NAME: &str = "scmb";

/// Connection lifecycle of the listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListenerState {
    /// Not published yet.
    Disconnected,

    /// Fetching trust material and opening a session.
    Connecting,

    /// Bound and receiving messages.
    Consuming,

    /// Waiting to reconnect after a failure.
    Reconnecting {
        /// Whether this retry is the free certificate reload.
        reload_certificates: bool,
    },

    /// Stopped by its owner.
    Stopped,

    /// Gave up after a fatal failure or an exhausted retry budget.
    Failed,
}

/// Options for creating a [`PushListener`].
pub struct PushListenerOptions<H> {
    /// Appliance providing statuses and broker trust material.
    pub hardware: Arc<H>,

    /// Broker transport.
    pub channel: Arc<dyn PushChannel>,

    /// Broker to connect to.
    pub endpoint: BrokerEndpoint,

    /// Reconnect budget.
    pub max_retry_attempts: u32,

    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,

    /// Invoked on fatal failures and when the budget runs out.
    pub crash_callback: CrashCallback,
}

struct Shared<H> {
    hardware: Arc<H>,
    channel: Arc<dyn PushChannel>,
    endpoint: BrokerEndpoint,
    monitored: MonitoredSet,
    subscribers: StatusProvider,
    crash_callback: CrashCallback,
    state: watch::Sender<ListenerState>,
}

/// Low-priority bus subscriber fed by broker push notifications.
pub struct PushListener<H>
where
    H: HardwareStatusService,
{
    cancellation_token: CancellationToken,
    max_retry_attempts: u32,
    reconnect_delay: Duration,
    shared: Arc<Shared<H>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<H> PushListener<H>
where
    H: HardwareStatusService,
{
    /// Creates a disconnected listener.
    pub fn new(
        PushListenerOptions {
            hardware,
            channel,
            endpoint,
            max_retry_attempts,
            reconnect_delay,
            crash_callback,
        }: PushListenerOptions<H>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);

        Self {
            cancellation_token: CancellationToken::new(),
            max_retry_attempts,
            reconnect_delay,
            shared: Arc::new(Shared {
                hardware,
                channel,
                endpoint,
                monitored: MonitoredSet::new(),
                subscribers: StatusProvider::new(),
                crash_callback,
                state,
            }),
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

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// Receiver observing every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Whether `id` is currently listened for.
    #[must_use]
    pub fn is_monitored(&self, id: &ResourceId) -> bool {
        self.shared.monitored.contains(id)
    }

    /// Starts the connect and consume loop.
    pub async fn publish(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancellation_token.is_cancelled() {
            debug!("push listener already published");
            return;
        }

        info!(host = %self.shared.endpoint.host, "initialize push listener");

        let shared = self.shared.clone();
        let token = self.cancellation_token.clone();
        let budget = self.max_retry_attempts;
        let delay = self.reconnect_delay;

        *task = Some(tokio::spawn(async move {
            shared.run(token, budget, delay).await;
        }));
    }

    /// Closes the session and stops the loop. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "push listener task failed");
        }

        self.shared.state.send_if_modified(|state| {
            if *state == ListenerState::Failed {
                return false;
            }
            *state = ListenerState::Stopped;
            true
        });
        info!("push listener stopped");
    }

    /// Handles one broker message as if it had just been received.
    ///
    /// # Errors
    ///
    /// Returns an error if the status could not be delivered to the
    /// subscribers.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<(), Error> {
        self.shared.handle_delivery(delivery).await
    }
}

impl<H: HardwareStatusService> Shared<H> {
    async fn run(&self, token: CancellationToken, mut budget: u32, delay: Duration) {
        let mut reload_certificates = true;

        while budget > 0 {
            let outcome = self.session(&token, &mut reload_certificates).await;
            if token.is_cancelled() {
                return;
            }

            let Err(e) = outcome else {
                return;
            };
            error!(error = %e, "push listener session failed");

            match e.kind() {
                FailureKind::Fatal => {
                    self.state.send_replace(ListenerState::Failed);
                    (self.crash_callback)(Box::new(e));
                    return;
                }
                FailureKind::Transport if reload_certificates => {
                    reload_certificates = false;
                    info!("connection with the message bus closed, validating certificates again");
                    self.state.send_replace(ListenerState::Reconnecting {
                        reload_certificates: true,
                    });
                    continue;
                }
                FailureKind::Transport | FailureKind::Other => {
                    budget -= 1;
                    if budget > 0 {
                        info!(remaining = budget, "trying to reconnect to the message bus");
                        self.state.send_replace(ListenerState::Reconnecting {
                            reload_certificates: false,
                        });
                    }
                }
            }

            if budget > 0 {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.state.send_replace(ListenerState::Failed);
        (self.crash_callback)(Box::new(Error::ConnectionPermanentlyFailed));
    }

    /// Runs one session until it fails or the token is cancelled, in which
    /// case it returns `Ok`. An opened session is always closed.
    async fn session(
        &self,
        token: &CancellationToken,
        reload_certificates: &mut bool,
    ) -> Result<(), Error> {
        self.state.send_replace(ListenerState::Connecting);

        let mut session = tokio::select! {
            () = token.cancelled() => return Ok(()),
            session = self.open() => session?,
        };

        let bound = tokio::select! {
            () = token.cancelled() => None,
            bound = session.bind_and_consume(&self.endpoint.exchange, &self.endpoint.routing_key) => {
                Some(bound)
            }
        };
        match bound {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                session.close().await;
                return Err(e.into());
            }
            None => {
                session.close().await;
                return Ok(());
            }
        }

        info!(routing_key = %self.endpoint.routing_key, "listening for state-change messages");
        *reload_certificates = true;
        self.state.send_replace(ListenerState::Consuming);

        let result = loop {
            let delivery = tokio::select! {
                () = token.cancelled() => break Ok(()),
                delivery = session.next_delivery() => delivery,
            };

            match delivery {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle_delivery(&delivery).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    break Err(ChannelError::Transport("session closed by broker".to_string()).into());
                }
                Err(e) => break Err(e.into()),
            }
        };

        session.close().await;
        result
    }

    async fn open(&self) -> Result<Box<dyn PushSession>, Error> {
        self.hardware
            .validate_trust_material()
            .await
            .map_err(trust_error)?;
        let trust_material = self
            .hardware
            .get_trust_material()
            .await
            .map_err(trust_error)?;

        Ok(self
            .channel
            .connect(&self.endpoint, &trust_material)
            .await?)
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> Result<(), Error> {
        let change = match message::parse(&delivery.body) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, routing_key = %delivery.routing_key, "ignoring malformed message");
                return Ok(());
            }
        };

        info!(routing_key = %delivery.routing_key, "pull metric for resource");

        if !self.monitored.contains(&change.uuid) {
            info!(
                resource = %change.uuid,
                "resource not monitored, waiting for discovery update"
            );
            return Ok(());
        }

        let record = match self.build_record(change) {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "failed to read pushed status");
                (self.crash_callback)(Box::new(e));
                return Ok(());
            }
        };

        self.subscribers
            .status_update(&StatusSet::from([record]))
            .await
            .map_err(Error::Delivery)
    }

    fn build_record(&self, change: ResourceChange) -> Result<StatusRecord, Error> {
        let code = self
            .hardware
            .get_status_for_code(&change.status)
            .map_err(|e| Error::StatusMapping {
                id: change.uuid.clone(),
                source: Box::new(e),
            })?;
        let modified_at = parse_timestamp(&change.modified)?;

        Ok(StatusRecord::new(change.uuid, code, modified_at))
    }
}

fn trust_error<E: HardwareError>(e: E) -> Error {
    Error::TrustMaterial {
        authentication: e.is_authentication(),
        local_io: e.is_local_io(),
        source: Box::new(e),
    }
}

#[async_trait]
impl<H> NodeSubscriber for PushListener<H>
where
    H: HardwareStatusService,
{
    fn name(&self) -> &'static str {
        LISTENER_NAME
    }

    async fn available(&self, nodes: &NodeSet) {
        self.shared.monitored.track(nodes);
    }

    async fn unavailable(&self, nodes: &NodeSet) {
        self.shared.monitored.untrack_empty(nodes);
    }
}
