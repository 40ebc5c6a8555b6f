use std::path::PathBuf;

use thiserror::Error;

/// The result type for the agent.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring or running the agent.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("cannot read config file {path}: {source}")]
    ReadConfig {
        /// Path given on the command line.
        path: PathBuf,

        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML of the expected shape.
    #[error("invalid config file: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML.
    #[error("cannot render config: {0}")]
    RenderConfig(#[from] toml::ser::Error),

    /// A generated configuration file could not be written.
    #[error("cannot write config file {path}: {source}")]
    WriteConfig {
        /// Destination path.
        path: PathBuf,

        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is well formed but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The event bus failed to start.
    #[error(transparent)]
    EventBus(#[from] ovm_eventbus::Error),

    /// Identity service error.
    #[error(transparent)]
    Keystone(#[from] ovm_keystone::Error),

    /// Appliance client error.
    #[error(transparent)]
    OneView(#[from] ovm_oneview::Error),

    /// Could not set global default subscriber.
    #[error("could not set global default subscriber: {0}")]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),

    /// Signal handler installation failed.
    #[error("cannot install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}
