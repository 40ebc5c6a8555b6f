use thiserror::Error;

/// Result type for model conversions.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when parsing model values.
#[derive(Debug, Error)]
pub enum Error {
    /// A timestamp string did not match the appliance format.
    #[error("invalid timestamp '{0}': {1}")]
    InvalidTimestamp(String, #[source] chrono::ParseError),

    /// A status string is not one of the known health states.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}
