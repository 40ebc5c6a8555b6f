use thiserror::Error;

use crate::ElectionError;

/// Errors raised by the leadership gate.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: ElectionError,
{
    /// The gate was started twice, or after it was stopped.
    #[error("leadership gate already started")]
    AlreadyStarted,

    /// The election service failed.
    #[error("election service failed: {0}")]
    Election(#[source] E),
}
