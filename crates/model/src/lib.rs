//! Shared data model for the monitoring agent: resources, metric descriptors,
//! status records and the measurements submitted to the metrics platform.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod measurement;
mod metric;
mod node;
mod status;

pub use error::{Error, Result};
pub use measurement::{AlertMeta, Measurement};
pub use metric::{MetricDescriptor, MetricSet, merge_metrics, remove_metrics};
pub use node::{Node, NodeSet, ResourceId};
pub use status::{StatusCode, StatusRecord, StatusSet, parse_timestamp};

use std::sync::Arc;

/// Error type carried through a crash report.
pub type CrashError = Box<dyn std::error::Error + Send + Sync>;

/// Callback a long-running component invokes when it hits an unrecoverable
/// failure. The owner decides whether to restart the pipeline or step down.
pub type CrashCallback = Arc<dyn Fn(CrashError) + Send + Sync>;
