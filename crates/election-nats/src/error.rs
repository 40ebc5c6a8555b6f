use ovm_election::ElectionError;
use thiserror::Error;

/// Errors that can occur when using the NATS election service.
#[derive(Error, Debug)]
pub enum Error {
    /// The NATS server could not be reached.
    #[error("NATS server unreachable: {0}")]
    Unreachable(String),

    /// The member has not been started.
    #[error("election member not started")]
    NotStarted,

    /// The group has not been created by this member.
    #[error("group '{0}' does not exist")]
    GroupNotFound(String),

    /// Error creating the KV store.
    #[error("NATS JetStream context error creating KV store: {0}")]
    CreateKvError(#[from] async_nats::jetstream::context::CreateKeyValueError),

    /// Error creating a key.
    #[error("NATS KV store create operation error: {0}")]
    CreateError(#[from] async_nats::jetstream::kv::CreateError),

    /// Error reading a key.
    #[error("NATS KV store entry operation error (get): {0}")]
    EntryError(#[from] async_nats::jetstream::kv::EntryError),

    /// Any other KV store operation failed.
    #[error("NATS KV store {operation} operation error: {message}")]
    Kv {
        /// Operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// Timeout error during NATS operation.
    #[error("NATS operation timed out after {attempts} attempts: {last_error}")]
    Timeout {
        /// Number of attempts made before timing out.
        attempts: usize,
        /// The last error message received.
        last_error: String,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({max_attempts}) exceeded for NATS operation: {last_error}")]
    MaxRetriesExceeded {
        /// Maximum number of attempts that were allowed.
        max_attempts: usize,
        /// The last error message received.
        last_error: String,
    },
}

impl ElectionError for Error {}
