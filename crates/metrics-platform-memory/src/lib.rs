//! In-memory metrics platform that records every submitted batch.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ovm_metrics_platform::{MetricsPlatform, MetricsPlatformError};
use ovm_model::Measurement;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors returned by the in-memory platform.
#[derive(Debug, Error)]
pub enum Error {
    /// Simulated transport failure.
    #[error("simulated transport failure")]
    Transport,
}

impl MetricsPlatformError for Error {}

/// Metrics platform that keeps submitted batches for inspection.
#[derive(Default)]
pub struct MemoryMetricsPlatform {
    batches: Mutex<Vec<Vec<Measurement>>>,
    pending_failures: AtomicUsize,
}

impl MemoryMetricsPlatform {
    /// Creates an empty platform.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` submissions fail.
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Every accepted batch, in submission order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<Measurement>> {
        self.batches.lock().clone()
    }

    /// Number of accepted batches.
    #[must_use]
    pub fn submissions(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl MetricsPlatform for MemoryMetricsPlatform {
    type Error = Error;

    async fn submit(&self, batch: &[Measurement]) -> Result<(), Self::Error> {
        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failing {
            return Err(Error::Transport);
        }

        self.batches.lock().push(batch.to_vec());
        Ok(())
    }
}
