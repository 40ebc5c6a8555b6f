use ovm_election::ElectionError;
use thiserror::Error;

/// Errors returned by the in-memory election service.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The hub is marked unreachable.
    #[error("coordination backend unreachable")]
    Unreachable,

    /// The member has not been started.
    #[error("member not started")]
    NotStarted,

    /// The group does not exist.
    #[error("group '{0}' does not exist")]
    GroupNotFound(String),
}

impl ElectionError for Error {}
