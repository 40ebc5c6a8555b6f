//! Monitoring agent forwarding appliance hardware health to an OpenStack
//! metrics platform.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod daemon;
mod error;

pub use config::{
    AgentConfig, AgentSection, CoordinationSection, DEFAULT_CERTIFICATE_DIR, DEFAULT_GROUP_NAME,
    IronicSection, OneViewSection, OpenStackSection, ServerListSection,
};
pub use daemon::{
    DEFAULT_RECONNECT_DELAY, Daemon, DaemonOptions, PipelineSettings, STOP_SETTLE_DELAY,
};
pub use error::{Error, Result};
