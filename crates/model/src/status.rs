use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::ResourceId;

const APPLIANCE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Health state reported by the hardware appliance, with its metric value.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum StatusCode {
    /// Healthy.
    #[serde(rename = "OK")]
    Ok = 0,

    /// Administratively disabled.
    Disabled = 1,

    /// Critical alert active.
    Critical = 2,

    /// Warning alert active.
    Warning = 3,

    /// Appliance cannot determine the state.
    Unknown = 4,
}

impl StatusCode {
    /// Value submitted to the metrics platform for this status.
    #[must_use]
    pub const fn value(self) -> f64 {
        self as u8 as f64
    }

    /// Status string as used by the appliance.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Disabled => "Disabled",
            Self::Critical => "Critical",
            Self::Warning => "Warning",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(Self::Ok),
            "Disabled" => Ok(Self::Disabled),
            "Critical" => Ok(Self::Critical),
            "Warning" => Ok(Self::Warning),
            "Unknown" => Ok(Self::Unknown),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// Latest known status of one resource.
///
/// Equality and hashing are by identity only.
#[derive(Clone, Debug)]
pub struct StatusRecord {
    /// Identity of the resource.
    pub id: ResourceId,

    /// Reported health state.
    pub code: StatusCode,

    /// When the appliance last modified the resource.
    pub modified_at: DateTime<Utc>,
}

impl StatusRecord {
    /// Creates a status record.
    pub fn new(id: impl Into<ResourceId>, code: StatusCode, modified_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            code,
            modified_at,
        }
    }

    /// Whether this record may replace `stored`. Ties are accepted.
    #[must_use]
    pub fn supersedes(&self, stored: &Self) -> bool {
        self.modified_at >= stored.modified_at
    }
}

impl PartialEq for StatusRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StatusRecord {}

impl Hash for StatusRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A batch of status records, at most one per resource.
pub type StatusSet = HashSet<StatusRecord>;

/// Parses an appliance timestamp such as `2016-03-03T18:02:41.379Z`.
///
/// # Errors
///
/// Returns [`Error::InvalidTimestamp`] if the string does not match.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, APPLIANCE_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::InvalidTimestamp(raw.to_string(), e))
}
