//! Leader election over NATS `JetStream` key-value buckets.
//!
//! Each group is a KV bucket whose `max_age` bounds how long a silent member
//! stays visible. Members heartbeat a `members.<id>` key; the leader holds the
//! `leader` key, acquired with `create` (or by updating an empty tombstone)
//! and refreshed by revision on every heartbeat.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::jetstream::kv::{Config as KvConfig, CreateErrorKind, Store as KvStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use ovm_election::{ElectionService, GroupEvent, WatchKind};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const LEADER_KEY: &str = "leader";
const MEMBER_KEY_PREFIX: &str = "members.";

/// Configuration for the `NatsElection`.
#[derive(Clone, Debug)]
pub struct NatsElectionConfig {
    /// Prefix of the per-group bucket names.
    pub bucket_prefix: String,

    /// The NATS client to use.
    pub client: Client,

    /// Identity of this member.
    pub member_id: String,

    /// How long a member or leader key survives without a heartbeat.
    pub member_ttl: Duration,

    /// Number of replicas for the KV store. Should be set to at least 3 in production for HA.
    pub num_replicas: usize,

    /// Whether to persist membership to disk.
    pub persist: bool,

    /// How long a member that stood down stays out of the next election. Defaults to 3 seconds.
    pub stand_down_cooldown: Option<Duration>,

    /// Timeout for individual NATS `JetStream` operations. Defaults to 10 seconds if not set.
    pub operation_timeout: Option<Duration>,

    /// Maximum number of retry attempts for failed operations. Defaults to 3 if not set.
    pub max_retries: Option<usize>,

    /// Base delay for exponential backoff between retries. Defaults to 100ms if not set.
    pub retry_base_delay: Option<Duration>,

    /// Maximum delay for exponential backoff. Defaults to 5 seconds if not set.
    pub retry_max_delay: Option<Duration>,
}

struct GroupState {
    store: KvStore,
    joined: bool,
    known_members: BTreeSet<String>,
    leader_revision: Option<u64>,
    cooldown_until: Option<Instant>,
}

/// An election member backed by NATS `JetStream` KV.
pub struct NatsElection {
    bucket_prefix: String,
    client: Client,
    jetstream_context: JetStreamContext,
    member_id: String,
    member_id_bytes: Bytes,
    member_ttl: Duration,
    num_replicas: usize,
    persist: bool,
    stand_down_cooldown: Duration,
    operation_timeout: Duration,
    max_retries: usize,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    started: AtomicBool,
    groups: Mutex<HashMap<String, GroupState>>,
    watches: parking_lot::Mutex<HashSet<(String, WatchKind)>>,
}

impl NatsElection {
    /// Creates a new instance of `NatsElection`. Buckets are created when
    /// groups are.
    #[must_use]
    pub fn new(
        NatsElectionConfig {
            bucket_prefix,
            client,
            member_id,
            member_ttl,
            num_replicas,
            persist,
            stand_down_cooldown,
            operation_timeout,
            max_retries,
            retry_base_delay,
            retry_max_delay,
        }: NatsElectionConfig,
    ) -> Self {
        let jetstream_context = async_nats::jetstream::new(client.clone());
        let member_id_bytes = Bytes::from(member_id.clone());

        Self {
            bucket_prefix,
            client,
            jetstream_context,
            member_id,
            member_id_bytes,
            member_ttl,
            num_replicas,
            persist,
            stand_down_cooldown: stand_down_cooldown.unwrap_or(Duration::from_secs(3)),
            operation_timeout: operation_timeout.unwrap_or(Duration::from_secs(10)),
            max_retries: max_retries.unwrap_or(3),
            retry_base_delay: retry_base_delay.unwrap_or(Duration::from_millis(100)),
            retry_max_delay: retry_max_delay.unwrap_or(Duration::from_secs(5)),
            started: AtomicBool::new(false),
            groups: Mutex::new(HashMap::new()),
            watches: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    fn bucket_name(&self, group: &str) -> String {
        let group: String = group
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{group}", self.bucket_prefix)
    }

    fn member_key(member_id: &str) -> String {
        format!("{MEMBER_KEY_PREFIX}{member_id}")
    }

    fn ensure_started(&self) -> Result<(), Error> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Executes an operation with retry logic and exponential backoff.
    async fn with_retry<F, Fut, R, E>(&self, operation_name: &str, operation: F) -> Result<R, Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<R, E>>,
        E: std::fmt::Display + std::fmt::Debug,
    {
        let mut attempts = 0;
        let mut delay = self.retry_base_delay;

        loop {
            attempts += 1;

            match tokio::time::timeout(self.operation_timeout, operation()).await {
                Ok(Ok(result)) => {
                    if attempts > 1 {
                        debug!(operation = operation_name, attempts, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    let error_str = e.to_string();
                    let is_retriable = error_str.contains("timeout")
                        || error_str.contains("connection")
                        || error_str.contains("unavailable")
                        || error_str.contains("temporary")
                        || error_str.contains("stream not found");

                    if !is_retriable || attempts >= self.max_retries {
                        if is_retriable {
                            error!(operation = operation_name, attempts, error = ?e, "operation failed after maximum retries");
                        } else {
                            debug!(operation = operation_name, error = ?e, "operation failed with non-retriable error");
                        }
                        return Err(Error::MaxRetriesExceeded {
                            max_attempts: if is_retriable { self.max_retries } else { 1 },
                            last_error: error_str,
                        });
                    }

                    warn!(operation = operation_name, attempt = attempts, delay = ?delay, error = ?e, "operation failed, retrying");
                }
                Err(_timeout) => {
                    if attempts >= self.max_retries {
                        error!(operation = operation_name, attempts, timeout = ?self.operation_timeout, "operation timed out after maximum retries");
                        return Err(Error::Timeout {
                            attempts,
                            last_error: format!(
                                "operation timed out after {:?}",
                                self.operation_timeout
                            ),
                        });
                    }

                    warn!(operation = operation_name, attempt = attempts, delay = ?delay, "operation timed out, retrying");
                }
            }

            tokio::time::sleep(delay).await;

            delay = std::cmp::min(
                delay.mul_f64(fastrand::f64().mul_add(0.1, 2.0)),
                self.retry_max_delay,
            );
        }
    }

    async fn get_kv_store(&self, group: &str) -> Result<KvStore, Error> {
        let kv_config = KvConfig {
            bucket: self.bucket_name(group),
            max_age: self.member_ttl,
            num_replicas: self.num_replicas,
            storage: if self.persist {
                async_nats::jetstream::stream::StorageType::File
            } else {
                async_nats::jetstream::stream::StorageType::Memory
            },
            ..Default::default()
        };

        self.with_retry("create_or_update_kv", || {
            let jetstream_context = self.jetstream_context.clone();
            let config = kv_config.clone();
            async move { jetstream_context.create_or_update_key_value(config).await }
        })
        .await
    }

    async fn heartbeat_membership(&self, store: &KvStore) -> Result<(), Error> {
        let key = Self::member_key(&self.member_id);
        self.with_retry("kv_put", || {
            let store = store.clone();
            let key = key.clone();
            let value = self.member_id_bytes.clone();
            async move { store.put(key, value).await }
        })
        .await?;
        Ok(())
    }

    async fn list_members(store: &KvStore) -> Result<BTreeSet<String>, Error> {
        let keys: Vec<String> = store
            .keys()
            .await
            .map_err(|e| Error::Kv {
                operation: "keys",
                message: e.to_string(),
            })?
            .try_collect()
            .await
            .map_err(|e| Error::Kv {
                operation: "keys",
                message: e.to_string(),
            })?;

        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(MEMBER_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    /// Tries to take the leader key. Returns the new revision on success.
    #[instrument(skip(self, store), fields(local_id = %self.member_id))]
    async fn try_acquire_leadership(&self, store: &KvStore) -> Result<Option<u64>, Error> {
        match store.create(LEADER_KEY, self.member_id_bytes.clone()).await {
            Ok(revision) => return Ok(Some(revision)),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let Some(entry) = store.entry(LEADER_KEY).await? else {
            debug!("create failed, but subsequent entry() found no key");
            return Ok(None);
        };

        if !entry.value.is_empty() {
            return Ok(None);
        }

        debug!(revision = entry.revision, "found empty tombstone, attempting to acquire");
        match store
            .update(LEADER_KEY, self.member_id_bytes.clone(), entry.revision)
            .await
        {
            Ok(revision) => Ok(Some(revision)),
            Err(e) => {
                debug!(error = %e, "failed to update tombstone, leadership likely taken by another");
                Ok(None)
            }
        }
    }

    async fn refresh_group(
        &self,
        name: &str,
        group: &mut GroupState,
        events: &mut Vec<GroupEvent>,
    ) -> Result<(), Error> {
        self.heartbeat_membership(&group.store).await?;

        let members = Self::list_members(&group.store).await?;
        for member in members.difference(&group.known_members) {
            events.push(GroupEvent::MemberJoined {
                group: name.to_string(),
                member: member.clone(),
            });
        }
        for member in group.known_members.difference(&members) {
            events.push(GroupEvent::MemberLeft {
                group: name.to_string(),
                member: member.clone(),
            });
        }
        group.known_members = members;

        if let Some(revision) = group.leader_revision {
            match group
                .store
                .update(LEADER_KEY, self.member_id_bytes.clone(), revision)
                .await
            {
                Ok(revision) => group.leader_revision = Some(revision),
                Err(e) => {
                    warn!(group = name, error = %e, "lost leadership, leader key changed");
                    group.leader_revision = None;
                    events.push(GroupEvent::LostLeadership {
                        group: name.to_string(),
                        member: self.member_id.clone(),
                    });
                }
            }
            return Ok(());
        }

        if group
            .cooldown_until
            .is_some_and(|until| Instant::now() < until)
        {
            return Ok(());
        }
        group.cooldown_until = None;

        if let Some(revision) = self.try_acquire_leadership(&group.store).await? {
            info!(group = name, member = %self.member_id, revision, "leadership acquired");
            group.leader_revision = Some(revision);
            events.push(GroupEvent::ElectedLeader {
                group: name.to_string(),
                member: self.member_id.clone(),
            });
        }

        Ok(())
    }

    async fn release_leadership(&self, store: &KvStore, revision: u64) {
        if let Err(e) = store.update(LEADER_KEY, Bytes::new(), revision).await {
            warn!(error = %e, "failed to release leader key");
        }
    }
}

#[async_trait]
impl ElectionService for NatsElection {
    type Error = Error;

    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn start(&self) -> Result<(), Self::Error> {
        match tokio::time::timeout(self.operation_timeout, self.client.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Unreachable(e.to_string())),
            Err(_) => {
                return Err(Error::Unreachable(format!(
                    "flush timed out after {:?}",
                    self.operation_timeout
                )));
            }
        }

        self.started.store(true, Ordering::SeqCst);
        info!(member = %self.member_id, "election member started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), Self::Error> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut groups = self.groups.lock().await;
        for (name, group) in groups.drain() {
            if let Some(revision) = group.leader_revision {
                self.release_leadership(&group.store, revision).await;
            }
            if group.joined
                && let Err(e) = group.store.delete(Self::member_key(&self.member_id)).await
            {
                warn!(group = %name, error = %e, "failed to remove membership key");
            }
        }

        info!(member = %self.member_id, "election member stopped");
        Ok(())
    }

    async fn create_group(&self, group: &str) -> Result<(), Self::Error> {
        self.ensure_started()?;

        let mut groups = self.groups.lock().await;
        if groups.contains_key(group) {
            return Ok(());
        }

        let store = self.get_kv_store(group).await?;
        groups.insert(
            group.to_string(),
            GroupState {
                store,
                joined: false,
                known_members: BTreeSet::new(),
                leader_revision: None,
                cooldown_until: None,
            },
        );
        Ok(())
    }

    async fn join_group(&self, group: &str) -> Result<(), Self::Error> {
        self.ensure_started()?;

        let mut groups = self.groups.lock().await;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;

        self.heartbeat_membership(&state.store).await?;
        state.joined = true;
        info!(group, member = %self.member_id, "joined group");
        Ok(())
    }

    async fn watch(&self, group: &str, kind: WatchKind) -> Result<(), Self::Error> {
        self.ensure_started()?;
        self.watches.lock().insert((group.to_string(), kind));
        Ok(())
    }

    async fn run_pending_events(&self) -> Result<Vec<GroupEvent>, Self::Error> {
        self.ensure_started()?;

        let mut events = Vec::new();
        let mut groups = self.groups.lock().await;
        for (name, group) in groups.iter_mut().filter(|(_, group)| group.joined) {
            self.refresh_group(name, group, &mut events).await?;
        }
        drop(groups);

        let watches = self.watches.lock();
        Ok(events
            .into_iter()
            .filter(|event| watches.contains(&(event.group().to_string(), event.kind())))
            .collect())
    }

    async fn stand_down_leader(&self, group: &str) -> Result<(), Self::Error> {
        self.ensure_started()?;

        let mut groups = self.groups.lock().await;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;

        if let Some(revision) = state.leader_revision.take() {
            self.release_leadership(&state.store, revision).await;
            state.cooldown_until = Some(Instant::now() + self.stand_down_cooldown);
            info!(group, member = %self.member_id, "stood down as leader");
        }
        Ok(())
    }
}
