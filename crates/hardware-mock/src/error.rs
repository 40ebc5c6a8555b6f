use ovm_hardware::HardwareError;
use thiserror::Error;

/// Errors returned by the mock appliance.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Credentials rejected.
    #[error("invalid username or password or directory")]
    Authentication,

    /// Appliance unreachable.
    #[error("appliance unavailable: {0}")]
    Unavailable(String),

    /// Local file operation failed, such as writing trust material.
    #[error("local I/O failed: {0}")]
    LocalIo(String),

    /// Unknown status string.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

impl HardwareError for Error {
    fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication)
    }

    fn is_local_io(&self) -> bool {
        matches!(self, Self::LocalIo(_))
    }
}
