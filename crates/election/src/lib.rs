//! Abstract interface for group membership and leader election, and the
//! leadership gate that runs the pipeline only on the elected member.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod gate;

pub use error::Error;
pub use gate::{
    DEFAULT_HEARTBEAT_INTERVAL, ElectedCallback, LeadershipGate, LeadershipGateOptions,
    LostCallback,
};

use std::error::Error as StdError;
use std::fmt::{self, Debug};

use async_trait::async_trait;
use uuid::Uuid;

/// Prefix of every generated member identity.
pub const MEMBER_ID_PREFIX: &str = "oneviewd";

/// Marker trait for `ElectionService` errors
pub trait ElectionError: Debug + StdError + Send + Sync + 'static {}

/// Generates a fresh member identity, `oneviewd-<uuid>`.
#[must_use]
pub fn generate_member_id() -> String {
    format!("{MEMBER_ID_PREFIX}-{}", Uuid::new_v4())
}

/// Kinds of group activity a member can watch.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WatchKind {
    /// A member joined the group.
    MemberJoined,

    /// A member left the group.
    MemberLeft,

    /// This member was elected leader of the group.
    ElectedLeader,

    /// This member lost leadership without standing down.
    LostLeadership,
}

/// Group activity reported by `run_pending_events`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupEvent {
    /// `member` joined `group`.
    MemberJoined {
        /// Group name.
        group: String,
        /// Member identity.
        member: String,
    },

    /// `member` left `group`.
    MemberLeft {
        /// Group name.
        group: String,
        /// Member identity.
        member: String,
    },

    /// `member` became leader of `group`.
    ElectedLeader {
        /// Group name.
        group: String,
        /// Member identity.
        member: String,
    },

    /// `member` no longer leads `group`, for example because its leader
    /// lease expired and a peer took it.
    LostLeadership {
        /// Group name.
        group: String,
        /// Member identity.
        member: String,
    },
}

impl GroupEvent {
    /// The watch kind that reports this event.
    #[must_use]
    pub const fn kind(&self) -> WatchKind {
        match self {
            Self::MemberJoined { .. } => WatchKind::MemberJoined,
            Self::MemberLeft { .. } => WatchKind::MemberLeft,
            Self::ElectedLeader { .. } => WatchKind::ElectedLeader,
            Self::LostLeadership { .. } => WatchKind::LostLeadership,
        }
    }

    /// The group the event happened in.
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            Self::MemberJoined { group, .. }
            | Self::MemberLeft { group, .. }
            | Self::ElectedLeader { group, .. }
            | Self::LostLeadership { group, .. } => group,
        }
    }
}

impl fmt::Display for GroupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberJoined { group, member } => {
                write!(f, "member {member} joined group {group}")
            }
            Self::MemberLeft { group, member } => write!(f, "member {member} left group {group}"),
            Self::ElectedLeader { group, member } => {
                write!(f, "member {member} elected leader of group {group}")
            }
            Self::LostLeadership { group, member } => {
                write!(f, "member {member} lost leadership of group {group}")
            }
        }
    }
}

/// A coordination client taking part in leader elections.
#[async_trait]
pub trait ElectionService: Send + Sync + 'static {
    /// The error type for election operations.
    type Error: ElectionError;

    /// Identity of this member.
    fn member_id(&self) -> &str;

    /// Connects to the coordination backend.
    async fn start(&self) -> Result<(), Self::Error>;

    /// Leaves every joined group and disconnects.
    async fn stop(&self) -> Result<(), Self::Error>;

    /// Creates `group`. Succeeds if it already exists.
    async fn create_group(&self, group: &str) -> Result<(), Self::Error>;

    /// Joins an existing `group`.
    async fn join_group(&self, group: &str) -> Result<(), Self::Error>;

    /// Starts reporting events of `kind` for `group`.
    async fn watch(&self, group: &str, kind: WatchKind) -> Result<(), Self::Error>;

    /// Heartbeats the membership and returns watched events that happened
    /// since the previous call.
    async fn run_pending_events(&self) -> Result<Vec<GroupEvent>, Self::Error>;

    /// Gives up leadership of `group` so another member can be elected.
    async fn stand_down_leader(&self, group: &str) -> Result<(), Self::Error>;
}
