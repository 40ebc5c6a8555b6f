//! In-memory (single process) election service for tests and single-host
//! deployments.
//!
//! Members share a [`MemoryElectionHub`]. Leadership goes to the earliest
//! joined member; standing down hands it to the next member in join order
//! and leaving re-elects.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use ovm_election::{ElectionService, GroupEvent, WatchKind, generate_member_id};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Default)]
struct Group {
    members: Vec<String>,
    leader: Option<String>,
}

#[derive(Default)]
struct HubState {
    groups: HashMap<String, Group>,
    started: HashSet<String>,
    watches: HashMap<String, HashSet<(String, WatchKind)>>,
    queues: HashMap<String, VecDeque<GroupEvent>>,
    unreachable: bool,
}

impl HubState {
    fn notify(&mut self, event: &GroupEvent, recipients: &[String]) {
        let key = (event.group().to_string(), event.kind());

        for member in recipients {
            let watching = self
                .watches
                .get(member)
                .is_some_and(|watches| watches.contains(&key));
            if watching {
                self.queues
                    .entry(member.clone())
                    .or_default()
                    .push_back(event.clone());
            }
        }
    }

    /// Elects `candidate` if the group has no leader, otherwise the first
    /// member in join order.
    fn elect(&mut self, group_name: &str, candidate: Option<String>) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        if group.leader.is_some() {
            return;
        }

        let Some(leader) = candidate.or_else(|| group.members.first().cloned()) else {
            return;
        };
        group.leader = Some(leader.clone());
        debug!(group = group_name, %leader, "leader elected");

        let event = GroupEvent::ElectedLeader {
            group: group_name.to_string(),
            member: leader.clone(),
        };
        self.notify(&event, &[leader]);
    }

    fn leave(&mut self, group_name: &str, member: &str) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        let Some(position) = group.members.iter().position(|m| m == member) else {
            return;
        };
        group.members.remove(position);
        if group.leader.as_deref() == Some(member) {
            group.leader = None;
        }
        let remaining = group.members.clone();

        let event = GroupEvent::MemberLeft {
            group: group_name.to_string(),
            member: member.to_string(),
        };
        self.notify(&event, &remaining);
        self.elect(group_name, None);
    }
}

/// The member following `member` in join order, wrapping around.
fn next_after(members: &[String], member: &str) -> Option<String> {
    let position = members.iter().position(|m| m == member)?;
    members.get((position + 1) % members.len()).cloned()
}

/// Shared coordination state for a set of in-memory members.
#[derive(Clone, Default)]
pub struct MemoryElectionHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryElectionHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a member with a generated identity.
    #[must_use]
    pub fn member(&self) -> MemoryElection {
        self.member_with_id(generate_member_id())
    }

    /// Creates a member with the given identity.
    #[must_use]
    pub fn member_with_id(&self, member_id: impl Into<String>) -> MemoryElection {
        MemoryElection {
            hub: self.clone(),
            member_id: member_id.into(),
        }
    }

    /// Makes `start` fail for every member, as if the backend were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Takes leadership of `group` away from its leader, as when its lease
    /// lapses and a peer claims it. The old leader is told it lost
    /// leadership and the next member in join order is elected. Returns the
    /// old leader.
    pub fn expire_leader(&self, group_name: &str) -> Option<String> {
        let mut state = self.state.lock();
        let group = state.groups.get_mut(group_name)?;
        let leader = group.leader.take()?;
        let next = next_after(&group.members, &leader);

        let event = GroupEvent::LostLeadership {
            group: group_name.to_string(),
            member: leader.clone(),
        };
        state.notify(&event, std::slice::from_ref(&leader));
        state.elect(group_name, next);
        Some(leader)
    }

    /// Current leader of `group`.
    #[must_use]
    pub fn leader(&self, group: &str) -> Option<String> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|group| group.leader.clone())
    }

    /// Members of `group` in join order.
    #[must_use]
    pub fn members(&self, group: &str) -> Vec<String> {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|group| group.members.clone())
            .unwrap_or_default()
    }
}

/// One member of a [`MemoryElectionHub`].
#[derive(Clone)]
pub struct MemoryElection {
    hub: MemoryElectionHub,
    member_id: String,
}

impl MemoryElection {
    fn ensure_started(&self, state: &HubState) -> Result<(), Error> {
        if state.started.contains(&self.member_id) {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }
}

#[async_trait]
impl ElectionService for MemoryElection {
    type Error = Error;

    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn start(&self) -> Result<(), Self::Error> {
        let mut state = self.hub.state.lock();
        if state.unreachable {
            return Err(Error::Unreachable);
        }
        state.started.insert(self.member_id.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), Self::Error> {
        let mut state = self.hub.state.lock();
        let joined: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, group)| group.members.contains(&self.member_id))
            .map(|(name, _)| name.clone())
            .collect();

        for group in joined {
            state.leave(&group, &self.member_id);
        }

        state.started.remove(&self.member_id);
        state.watches.remove(&self.member_id);
        state.queues.remove(&self.member_id);
        Ok(())
    }

    async fn create_group(&self, group: &str) -> Result<(), Self::Error> {
        let mut state = self.hub.state.lock();
        self.ensure_started(&state)?;
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn join_group(&self, group_name: &str) -> Result<(), Self::Error> {
        let mut state = self.hub.state.lock();
        self.ensure_started(&state)?;

        let group = state
            .groups
            .get_mut(group_name)
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;
        if group.members.contains(&self.member_id) {
            return Ok(());
        }
        group.members.push(self.member_id.clone());
        let members = group.members.clone();

        let event = GroupEvent::MemberJoined {
            group: group_name.to_string(),
            member: self.member_id.clone(),
        };
        state.notify(&event, &members);
        state.elect(group_name, None);
        Ok(())
    }

    async fn watch(&self, group: &str, kind: WatchKind) -> Result<(), Self::Error> {
        let mut state = self.hub.state.lock();
        self.ensure_started(&state)?;
        state
            .watches
            .entry(self.member_id.clone())
            .or_default()
            .insert((group.to_string(), kind));
        Ok(())
    }

    async fn run_pending_events(&self) -> Result<Vec<GroupEvent>, Self::Error> {
        let mut state = self.hub.state.lock();
        self.ensure_started(&state)?;
        Ok(state
            .queues
            .get_mut(&self.member_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default())
    }

    async fn stand_down_leader(&self, group_name: &str) -> Result<(), Self::Error> {
        let mut state = self.hub.state.lock();
        self.ensure_started(&state)?;

        let group = state
            .groups
            .get_mut(group_name)
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;
        if group.leader.as_deref() != Some(self.member_id.as_str()) {
            return Ok(());
        }
        group.leader = None;
        let next = next_after(&group.members, &self.member_id);

        state.elect(group_name, next);
        Ok(())
    }
}
