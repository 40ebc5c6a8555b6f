use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the server list driver.
#[derive(Debug, Error)]
pub enum Error {
    /// The MAC file could not be read.
    #[error("error reading the mac file {path}: {source}")]
    ReadMacFile {
        /// Configured path.
        path: PathBuf,

        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The MAC file is not valid YAML of the expected shape.
    #[error("invalid mac file: {0}")]
    ParseMacFile(#[from] serde_yaml::Error),

    /// The appliance failed to resolve a MAC address.
    #[error("failed to resolve mac {mac}: {source}")]
    Lookup {
        /// MAC address being resolved.
        mac: String,

        /// Appliance error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
