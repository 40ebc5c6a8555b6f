use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ovm_election::{ElectionService, LeadershipGate, LeadershipGateOptions};
use ovm_eventbus::{EventBus, NodeSubscriber, Priority};
use ovm_hardware::HardwareStatusService;
use ovm_keeper::{AGGREGATOR_NAME, Aggregator, AggregatorOptions};
use ovm_metrics_platform::MetricsPlatform;
use ovm_model::{CrashCallback, CrashError};
use ovm_puller::{StatusPoller, StatusPollerOptions};
use ovm_scmb::{BrokerEndpoint, PushChannel, PushListener, PushListenerOptions};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

/// Pause before tearing a pipeline down, letting in-flight deliveries land.
pub const STOP_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Pause between two push channel connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Timing and budgets of the components built for each pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Period of the aggregator batch.
    pub batch_interval: Duration,

    /// Period of the status poller.
    pub refresh_interval: Duration,

    /// Reconnection budget of the push listener.
    pub max_retry_attempts: u32,

    /// Pause between two push channel connection attempts.
    pub reconnect_delay: Duration,

    /// Broker the push listener connects to.
    pub broker: BrokerEndpoint,

    /// Pause before tearing a pipeline down.
    pub stop_settle_delay: Duration,
}

/// Options for creating a [`Daemon`].
pub struct DaemonOptions<H, M, E> {
    /// Bus shared by every pipeline.
    pub bus: Arc<EventBus>,

    /// Appliance queried by every component.
    pub hardware: Arc<H>,

    /// Destination of the measurements.
    pub platform: Arc<M>,

    /// Push notification transport. Without one, statuses come from
    /// polling only.
    pub push_channel: Option<Arc<dyn PushChannel>>,

    /// Election backend. Without one, the pipeline runs unconditionally.
    pub election: Option<Arc<E>>,

    /// Election group.
    pub group: String,

    /// Component settings.
    pub settings: PipelineSettings,
}

enum Command {
    Start,
    Stop,
    Crash { generation: u64, error: CrashError },
}

struct Pipeline<H, M>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
{
    generation: u64,
    aggregator: Arc<Aggregator<H, M>>,
    poller: Arc<StatusPoller<H>>,
    listener: Option<Arc<PushListener<H>>>,
}

/// Owns the monitoring pipeline and decides, on leadership changes and
/// crashes, when it runs.
pub struct Daemon<H, M, E>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
    E: ElectionService,
{
    bus: Arc<EventBus>,
    cancellation_token: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    gate: Mutex<Option<Arc<LeadershipGate<E>>>>,
    generation: AtomicU64,
    hardware: Arc<H>,
    pipeline: Mutex<Option<Pipeline<H, M>>>,
    platform: Arc<M>,
    push_channel: Option<Arc<dyn PushChannel>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    settings: PipelineSettings,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<H, M, E> Daemon<H, M, E>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
    E: ElectionService,
{
    /// Creates an idle daemon.
    pub fn new(
        DaemonOptions {
            bus,
            hardware,
            platform,
            push_channel,
            election,
            group,
            settings,
        }: DaemonOptions<H, M, E>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();

        let gate = election.map(|election| {
            let elected = commands.clone();
            let lost = commands.clone();
            Arc::new(LeadershipGate::new(LeadershipGateOptions {
                election,
                group,
                heartbeat_interval: ovm_election::DEFAULT_HEARTBEAT_INTERVAL,
                on_elected: Arc::new(move || {
                    if elected.send(Command::Start).is_err() {
                        warn!("elected after shutdown");
                    }
                }),
                on_lost: Arc::new(move || {
                    if lost.send(Command::Stop).is_err() {
                        warn!("leadership lost after shutdown");
                    }
                }),
            }))
        });

        Self {
            bus,
            cancellation_token: CancellationToken::new(),
            commands,
            gate: Mutex::new(gate),
            generation: AtomicU64::new(0),
            hardware,
            pipeline: Mutex::new(None),
            platform,
            push_channel,
            receiver: Mutex::new(Some(receiver)),
            settings,
            supervisor: Mutex::new(None),
        }
    }

    /// Starts supervising and either joins the election group or, without
    /// coordination, starts the pipeline at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is started directly and fails to
    /// start.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(receiver) = self.receiver.lock().await.take() else {
            return Ok(());
        };

        *self.supervisor.lock().await = Some(tokio::spawn(supervise(
            Arc::downgrade(self),
            receiver,
            self.cancellation_token.clone(),
        )));

        let gate = self.gate.lock().await.clone();
        if let Some(gate) = gate {
            match gate.start().await {
                Ok(()) => {
                    info!(member = %gate.member_id(), "waiting for leadership");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "the agent is running without active/passive fault tolerance");
                    self.gate.lock().await.take();
                }
            }
        }

        self.start_pipeline().await
    }

    /// Whether a leadership gate protects the pipeline.
    pub async fn is_protected(&self) -> bool {
        self.gate.lock().await.is_some()
    }

    /// Whether a pipeline is running.
    pub async fn is_running(&self) -> bool {
        self.pipeline.lock().await.is_some()
    }

    /// Number of pipelines started so far.
    #[must_use]
    pub fn pipelines_started(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Builds fresh components and wires them to the bus. Does nothing if a
    /// pipeline is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus fails to load its discovery drivers.
    pub async fn start_pipeline(&self) -> Result<()> {
        let mut slot = self.pipeline.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        info!("creating event bus");
        if let Err(e) = self.bus.start().await {
            self.bus.stop().await;
            return Err(e.into());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = &self.settings;

        info!(generation, "creating publishers");
        let aggregator = Arc::new(Aggregator::new(AggregatorOptions {
            hardware: self.hardware.clone(),
            platform: self.platform.clone(),
            batch_interval: settings.batch_interval,
        }));
        let poller = Arc::new(StatusPoller::new(StatusPollerOptions {
            hardware: self.hardware.clone(),
            refresh_interval: settings.refresh_interval,
            crash_callback: self.crash_callback(generation),
        }));
        let listener = self.push_channel.as_ref().map(|channel| {
            Arc::new(PushListener::new(PushListenerOptions {
                hardware: self.hardware.clone(),
                channel: channel.clone(),
                endpoint: settings.broker.clone(),
                max_retry_attempts: settings.max_retry_attempts,
                reconnect_delay: settings.reconnect_delay,
                crash_callback: self.crash_callback(generation),
            }))
        });

        aggregator.publish().await;
        poller.publish().await;
        if let Some(listener) = &listener {
            listener.publish().await;
        }

        info!("subscribing aggregator to publishers");
        if let Some(listener) = &listener {
            listener.subscribe(aggregator.clone());
        }
        poller.subscribe(aggregator.clone());

        info!("subscribing publishers to event bus");
        self.bus.subscribe(aggregator.clone(), Priority::High).await;
        if let Some(listener) = &listener {
            self.bus.subscribe(listener.clone(), Priority::Low).await;
        }
        self.bus.subscribe(poller.clone(), Priority::Low).await;

        *slot = Some(Pipeline {
            generation,
            aggregator,
            poller,
            listener,
        });

        Ok(())
    }

    /// Waits for in-flight work to settle, then unwires and stops every
    /// component and the bus. Does nothing if no pipeline runs.
    pub async fn stop_pipeline(&self) {
        let mut slot = self.pipeline.lock().await;
        let Some(pipeline) = slot.take() else {
            return;
        };

        tokio::time::sleep(self.settings.stop_settle_delay).await;

        info!(generation = pipeline.generation, "unsubscribing publishers from event bus");
        let poller: Arc<dyn NodeSubscriber> = pipeline.poller.clone();
        self.bus.unsubscribe(&poller).await;
        if let Some(listener) = &pipeline.listener {
            let listener: Arc<dyn NodeSubscriber> = listener.clone();
            self.bus.unsubscribe(&listener).await;
        }
        let aggregator: Arc<dyn NodeSubscriber> = pipeline.aggregator.clone();
        self.bus.unsubscribe(&aggregator).await;

        pipeline.poller.unsubscribe(AGGREGATOR_NAME);
        if let Some(listener) = &pipeline.listener {
            listener.unsubscribe(AGGREGATOR_NAME);
        }

        info!("stopping publishers");
        pipeline.aggregator.stop().await;
        pipeline.poller.stop().await;
        if let Some(listener) = &pipeline.listener {
            listener.stop().await;
        }
        self.bus.stop().await;

        info!("daemon stopped, ready to re-initialize");
    }

    /// Leaves the election group and stops the pipeline.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();

        if let Some(handle) = self.supervisor.lock().await.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "supervisor task failed");
        }

        let gate = self.gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.stop().await;
        }

        self.stop_pipeline().await;
    }

    fn crash_callback(&self, generation: u64) -> CrashCallback {
        let commands = self.commands.clone();
        Arc::new(move |error| {
            if commands.send(Command::Crash { generation, error }).is_err() {
                warn!("crash reported after shutdown");
            }
        })
    }

    async fn on_elected(&self) {
        info!("elected leader, starting pipeline");
        if let Err(e) = self.start_pipeline().await {
            error!(error = %e, "failed to start pipeline");
            self.step_down().await;
        }
    }

    async fn on_lost(&self) {
        warn!("leadership lost, stopping pipeline");
        self.stop_pipeline().await;
    }

    async fn on_crash(&self, generation: u64, error: CrashError) {
        let current = self.pipeline.lock().await.as_ref().map(|p| p.generation);
        if current != Some(generation) {
            info!(generation, error = %error, "ignoring crash of a retired pipeline");
            return;
        }

        error!(error = %error, "pipeline crashed");
        self.stop_pipeline().await;

        if self.is_protected().await {
            self.step_down().await;
        } else if let Err(e) = self.start_pipeline().await {
            error!(error = %e, "failed to restart pipeline");
        }
    }

    async fn step_down(&self) {
        let gate = self.gate.lock().await.clone();
        if let Some(gate) = gate
            && let Err(e) = gate.step_down().await
        {
            warn!(error = %e, "failed to step down");
        }
    }
}

async fn supervise<H, M, E>(
    daemon: Weak<Daemon<H, M, E>>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
) where
    H: HardwareStatusService,
    M: MetricsPlatform,
    E: ElectionService,
{
    loop {
        let command = tokio::select! {
            () = token.cancelled() => break,
            command = receiver.recv() => command,
        };

        let (Some(command), Some(daemon)) = (command, daemon.upgrade()) else {
            break;
        };

        match command {
            Command::Start => daemon.on_elected().await,
            Command::Stop => daemon.on_lost().await,
            Command::Crash { generation, error } => daemon.on_crash(generation, error).await,
        }
    }
}
