use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ElectionService, Error, GroupEvent, WatchKind};

/// Pause between two rounds of event dispatch.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Invoked each time this member wins an election.
pub type ElectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked when this member loses leadership it did not give up.
pub type LostCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    NotStarted,
    Running,
    Stopped,
}

/// Options for creating a [`LeadershipGate`].
pub struct LeadershipGateOptions<E> {
    /// Coordination client.
    pub election: Arc<E>,

    /// Election group shared by every agent instance.
    pub group: String,

    /// Interval of the dispatch loop.
    pub heartbeat_interval: Duration,

    /// Startup callback, run once per election win.
    pub on_elected: ElectedCallback,

    /// Shutdown callback, run when leadership is taken away.
    pub on_lost: LostCallback,
}

struct Dispatcher<E> {
    election: Arc<E>,
    group: String,
    is_leader: AtomicBool,
    on_elected: ElectedCallback,
    on_lost: LostCallback,
}

impl<E: ElectionService> Dispatcher<E> {
    async fn run_round(&self) {
        let events = match self.election.run_pending_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "failed to run election watchers");
                return;
            }
        };

        for event in events {
            match &event {
                GroupEvent::ElectedLeader { group, member }
                    if *group == self.group && member == self.election.member_id() =>
                {
                    if self.is_leader.swap(true, Ordering::SeqCst) {
                        debug!(%member, "re-elected while already leading");
                        continue;
                    }
                    info!(%member, "member is now running the daemon");
                    (self.on_elected)();
                }
                GroupEvent::LostLeadership { group, member }
                    if *group == self.group && member == self.election.member_id() =>
                {
                    if !self.is_leader.swap(false, Ordering::SeqCst) {
                        debug!(%member, "lost leadership while not leading");
                        continue;
                    }
                    warn!(%member, "leadership lost, stopping the daemon");
                    (self.on_lost)();
                }
                _ => info!("{event}"),
            }
        }
    }
}

/// Runs a startup callback only while this member leads its group.
pub struct LeadershipGate<E>
where
    E: ElectionService,
{
    cancellation_token: CancellationToken,
    dispatcher: Arc<Dispatcher<E>>,
    heartbeat_interval: Duration,
    state: RwLock<GateState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E> LeadershipGate<E>
where
    E: ElectionService,
{
    /// Creates a gate that has not joined its group yet.
    pub fn new(
        LeadershipGateOptions {
            election,
            group,
            heartbeat_interval,
            on_elected,
            on_lost,
        }: LeadershipGateOptions<E>,
    ) -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
            dispatcher: Arc::new(Dispatcher {
                election,
                group,
                is_leader: AtomicBool::new(false),
                on_elected,
                on_lost,
            }),
            heartbeat_interval,
            state: RwLock::new(GateState::NotStarted),
            task: Mutex::new(None),
        }
    }

    /// Identity of this member.
    #[must_use]
    pub fn member_id(&self) -> &str {
        self.dispatcher.election.member_id()
    }

    /// Whether this member currently leads the group.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.dispatcher.is_leader.load(Ordering::SeqCst)
    }

    /// Joins the group and starts dispatching election events.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination service cannot be reached or
    /// initialised. The caller then runs without fault tolerance.
    pub async fn start(&self) -> Result<(), Error<E::Error>> {
        let mut state = self.state.write().await;
        if *state != GateState::NotStarted {
            return Err(Error::AlreadyStarted);
        }

        info!(member = %self.member_id(), group = %self.dispatcher.group, "initializing a new coordinator");

        if let Err(e) = self.join().await {
            if let Err(stop_error) = self.dispatcher.election.stop().await {
                debug!(error = %stop_error, "failed to stop election client after setup failure");
            }
            return Err(Error::Election(e));
        }

        let dispatcher = self.dispatcher.clone();
        let token = self.cancellation_token.clone();
        let period = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => dispatcher.run_round().await,
                }
            }
        });

        *self.task.lock().await = Some(handle);
        *state = GateState::Running;

        Ok(())
    }

    async fn join(&self) -> Result<(), E::Error> {
        let election = &self.dispatcher.election;
        let group = &self.dispatcher.group;

        election.start().await?;
        election.create_group(group).await?;
        for kind in [
            WatchKind::MemberJoined,
            WatchKind::MemberLeft,
            WatchKind::ElectedLeader,
            WatchKind::LostLeadership,
        ] {
            election.watch(group, kind).await?;
        }
        election.join_group(group).await
    }

    /// Relinquishes leadership so another member can take over.
    ///
    /// # Errors
    ///
    /// Returns an error if the election service rejects the stand-down.
    pub async fn step_down(&self) -> Result<(), Error<E::Error>> {
        info!(member = %self.member_id(), "standing down as group leader");

        self.dispatcher.is_leader.store(false, Ordering::SeqCst);
        self.dispatcher
            .election
            .stand_down_leader(&self.dispatcher.group)
            .await
            .map_err(Error::Election)
    }

    /// Stops the dispatch loop and the election client. Safe to call more
    /// than once.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if *state == GateState::Stopped {
            return;
        }
        let was_running = *state == GateState::Running;
        *state = GateState::Stopped;

        self.cancellation_token.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "leadership gate task failed");
        }

        if was_running && let Err(e) = self.dispatcher.election.stop().await {
            warn!(error = %e, "failed to stop election client");
        }

        self.dispatcher.is_leader.store(false, Ordering::SeqCst);
        info!("leadership gate stopped");
    }
}
