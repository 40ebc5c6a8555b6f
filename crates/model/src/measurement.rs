use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::metric::MetricDescriptor;
use crate::status::StatusRecord;

/// Alert metadata for one resource: alert URI to the alert's page on the
/// appliance.
pub type AlertMeta = BTreeMap<String, String>;

/// One timestamped value ready for submission to the metrics platform.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Measurement {
    /// Metric name.
    pub name: String,

    /// Metric value.
    pub value: f64,

    /// Milliseconds since the Unix epoch at which the value was produced.
    pub timestamp: i64,

    /// Dimension tags.
    pub dimensions: BTreeMap<String, String>,

    /// Additional information about the value.
    pub value_meta: BTreeMap<String, String>,
}

impl Measurement {
    /// Builds a measurement stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        value: f64,
        dimensions: BTreeMap<String, String>,
        value_meta: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now().timestamp_millis(),
            dimensions,
            value_meta,
        }
    }

    /// Builds the measurement of `metric` for a resource in `status`.
    #[must_use]
    pub fn for_status(metric: &MetricDescriptor, status: &StatusRecord, meta: &AlertMeta) -> Self {
        Self::new(
            metric.name.clone(),
            status.code.value(),
            metric.dimensions.clone(),
            meta.clone(),
        )
    }
}
