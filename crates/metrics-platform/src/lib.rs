//! Abstract interface to the metrics platform measurements are pushed to.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use ovm_model::Measurement;

/// Marker trait for `MetricsPlatform` errors.
pub trait MetricsPlatformError: Debug + Error + Send + Sync + 'static {}

/// Destination for batches of measurements.
#[async_trait]
pub trait MetricsPlatform: Send + Sync + 'static {
    /// The error type for submissions.
    type Error: MetricsPlatformError;

    /// Submits one batch. Callers never pass an empty batch.
    async fn submit(&self, batch: &[Measurement]) -> Result<(), Self::Error>;
}
