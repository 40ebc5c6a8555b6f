//! Aggregator that keeps the latest status, metrics and alert metadata of
//! every monitored resource and pushes measurements to the metrics platform,
//! both when a newer status arrives and on a fixed batch interval.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{Error, Result};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovm_eventbus::{NodeSubscriber, StatusSubscriber, SubscriberError};
use ovm_hardware::HardwareStatusService;
use ovm_metrics_platform::MetricsPlatform;
use ovm_model::{
    AlertMeta, Measurement, MetricSet, NodeSet, ResourceId, StatusRecord, StatusSet, merge_metrics,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Name the aggregator registers under with producers.
pub const AGGREGATOR_NAME: &str = "keeper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct Entry {
    metrics: MetricSet,
    status: Option<StatusRecord>,
    meta: AlertMeta,
}

impl Entry {
    fn measurements(&self) -> Vec<Measurement> {
        self.status.as_ref().map_or_else(Vec::new, |status| {
            self.metrics
                .iter()
                .map(|metric| Measurement::for_status(metric, status, &self.meta))
                .collect()
        })
    }
}

type Entries = Arc<Mutex<HashMap<ResourceId, Entry>>>;

/// Options for creating an [`Aggregator`].
pub struct AggregatorOptions<H, M> {
    /// Appliance used to fetch alert metadata.
    pub hardware: Arc<H>,

    /// Destination for measurements.
    pub platform: Arc<M>,

    /// Period of the batch re-emission of every known measurement.
    pub batch_interval: Duration,
}

/// Single source of truth for the status of every monitored resource.
pub struct Aggregator<H, M>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
{
    batch_interval: Duration,
    cancellation_token: CancellationToken,
    entries: Entries,
    hardware: Arc<H>,
    platform: Arc<M>,
    state: RwLock<ServiceState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<H, M> Aggregator<H, M>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
{
    /// Creates an aggregator with no known resources.
    pub fn new(
        AggregatorOptions {
            hardware,
            platform,
            batch_interval,
        }: AggregatorOptions<H, M>,
    ) -> Self {
        Self {
            batch_interval,
            cancellation_token: CancellationToken::new(),
            entries: Arc::new(Mutex::new(HashMap::new())),
            hardware,
            platform,
            state: RwLock::new(ServiceState::NotStarted),
            task: Mutex::new(None),
        }
    }

    /// Starts the batch loop. Calling it again while running does nothing.
    pub async fn publish(&self) {
        let mut state = self.state.write().await;
        if *state != ServiceState::NotStarted {
            debug!("aggregator already published");
            return;
        }

        info!(batch_interval = ?self.batch_interval, "starting aggregator");

        let entries = self.entries.clone();
        let platform = self.platform.clone();
        let token = self.cancellation_token.clone();
        let period = self.batch_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        match flush(&entries, platform.as_ref()).await {
                            Ok(count) => debug!(count, "batch published"),
                            Err(e) => error!(error = %e, "batch publishing failed"),
                        }
                    }
                }
            }
        });

        *self.task.lock().await = Some(handle);
        *state = ServiceState::Running;
    }

    /// Stops the batch loop, letting an in-flight batch finish. Safe to call
    /// when the loop never started.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if *state == ServiceState::Stopped {
            return;
        }

        self.cancellation_token.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "aggregator task failed");
        }

        *state = ServiceState::Stopped;
        info!("aggregator stopped");
    }

    /// Records newer statuses and submits one measurement per known metric
    /// for every resource whose status changed.
    ///
    /// A status is stored only if the resource is known and the status is
    /// the first one or not older than the stored one. Nothing is stored
    /// unless the alert metadata of every accepted status was fetched.
    ///
    /// # Errors
    ///
    /// Returns an error if alert metadata cannot be fetched or the batch
    /// cannot be submitted.
    pub async fn status_update(&self, statuses: &StatusSet) -> Result<()> {
        let accepted = self.accepted(statuses).await;

        let mut staged = Vec::with_capacity(accepted.len());
        for status in accepted {
            let meta = self
                .hardware
                .get_alerts(&status.id, status.code)
                .await
                .map_err(|e| Error::Alerts {
                    id: status.id.clone(),
                    source: Box::new(e),
                })?;
            staged.push((status, meta));
        }

        let batch = self.commit(staged).await;

        if batch.is_empty() {
            info!("there are no metrics to be sent");
            return Ok(());
        }

        debug!(count = batch.len(), "submitting updated measurements");
        self.platform
            .submit(&batch)
            .await
            .map_err(|e| Error::Submit(Box::new(e)))
    }

    /// Submits the current measurement of every resource that has a status.
    /// Returns how many measurements were submitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be submitted.
    pub async fn flush(&self) -> Result<usize> {
        flush(&self.entries, self.platform.as_ref()).await
    }

    /// Stored status of `id`.
    pub async fn status(&self, id: &ResourceId) -> Option<StatusRecord> {
        self.entries
            .lock()
            .await
            .get(id)
            .and_then(|entry| entry.status.clone())
    }

    /// Stored alert metadata of `id`.
    pub async fn meta(&self, id: &ResourceId) -> Option<AlertMeta> {
        self.entries.lock().await.get(id).map(|entry| entry.meta.clone())
    }

    /// Metric names stored for `id`, sorted.
    pub async fn metric_names(&self, id: &ResourceId) -> Option<Vec<String>> {
        self.entries.lock().await.get(id).map(|entry| {
            let mut names: Vec<String> = entry.metrics.iter().map(|m| m.name.clone()).collect();
            names.sort_unstable();
            names
        })
    }

    /// Number of known resources.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no resource is known.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn accepted(&self, statuses: &StatusSet) -> Vec<StatusRecord> {
        let entries = self.entries.lock().await;

        statuses
            .iter()
            .filter(|status| {
                let Some(entry) = entries.get(&status.id) else {
                    debug!(resource = %status.id, "status for unknown resource ignored");
                    return false;
                };

                match &entry.status {
                    None => {
                        info!(resource = %status.id, status = %status.code, "gathered first status");
                        true
                    }
                    Some(stored) if status.supersedes(stored) => true,
                    Some(stored) => {
                        debug!(
                            resource = %status.id,
                            stored = %stored.modified_at,
                            received = %status.modified_at,
                            "stale status ignored"
                        );
                        false
                    }
                }
            })
            .cloned()
            .collect()
    }

    /// Stores staged statuses with their alerts and returns the measurements
    /// of the resources that took them. Entries evicted or overtaken since
    /// staging are skipped.
    async fn commit(&self, staged: Vec<(StatusRecord, AlertMeta)>) -> Vec<Measurement> {
        let mut entries = self.entries.lock().await;
        let mut batch = Vec::new();

        for (status, meta) in staged {
            let Some(entry) = entries.get_mut(&status.id) else {
                continue;
            };
            if entry
                .status
                .as_ref()
                .is_some_and(|stored| !status.supersedes(stored))
            {
                continue;
            }

            entry.status = Some(status);
            entry.meta = meta;
            batch.extend(entry.measurements());
        }

        batch
    }
}

async fn flush<M: MetricsPlatform>(entries: &Entries, platform: &M) -> Result<usize> {
    let batch: Vec<Measurement> = entries
        .lock()
        .await
        .values()
        .flat_map(Entry::measurements)
        .collect();

    if batch.is_empty() {
        return Ok(0);
    }

    platform
        .submit(&batch)
        .await
        .map_err(|e| Error::Submit(Box::new(e)))?;

    Ok(batch.len())
}

#[async_trait]
impl<H, M> NodeSubscriber for Aggregator<H, M>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
{
    fn name(&self) -> &'static str {
        AGGREGATOR_NAME
    }

    async fn available(&self, nodes: &NodeSet) {
        let mut entries = self.entries.lock().await;

        for node in nodes {
            match entries.get_mut(&node.id) {
                Some(entry) => {
                    merge_metrics(&mut entry.metrics, &node.metrics);
                }
                None => {
                    info!(resource = %node.id, metrics = ?node.metric_names(), "node discovered");
                    entries.insert(
                        node.id.clone(),
                        Entry {
                            metrics: node.metrics.clone(),
                            ..Entry::default()
                        },
                    );
                }
            }
        }
    }

    async fn unavailable(&self, nodes: &NodeSet) {
        let mut entries = self.entries.lock().await;

        for node in nodes {
            if entries.remove(&node.id).is_some() {
                info!(resource = %node.id, metrics = ?node.metric_names(), "node removed");
            }
        }
    }
}

#[async_trait]
impl<H, M> StatusSubscriber for Aggregator<H, M>
where
    H: HardwareStatusService,
    M: MetricsPlatform,
{
    fn name(&self) -> &'static str {
        AGGREGATOR_NAME
    }

    async fn status_update(&self, statuses: &StatusSet) -> std::result::Result<(), SubscriberError> {
        Self::status_update(self, statuses)
            .await
            .map_err(SubscriberError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{DateTime, TimeZone, Utc};
    use ovm_hardware_mock::{MockHardware, Operation};
    use ovm_metrics_platform_memory::MemoryMetricsPlatform;
    use ovm_model::{MetricDescriptor, Node, StatusCode};
    use std::collections::BTreeMap;

    type TestAggregator = Aggregator<MockHardware, MemoryMetricsPlatform>;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn setup() -> (TestAggregator, Arc<MockHardware>, Arc<MemoryMetricsPlatform>) {
        let hardware = Arc::new(MockHardware::new());
        let platform = Arc::new(MemoryMetricsPlatform::new());
        let aggregator = Aggregator::new(AggregatorOptions {
            hardware: hardware.clone(),
            platform: platform.clone(),
            batch_interval: Duration::from_secs(60),
        });
        (aggregator, hardware, platform)
    }

    fn node(id: &str, names: &[&str]) -> Node {
        Node::new(
            id,
            names
                .iter()
                .map(|name| MetricDescriptor::new(*name, BTreeMap::new()))
                .collect(),
        )
    }

    fn status(id: &str, code: StatusCode, millis: i64) -> StatusSet {
        StatusSet::from([StatusRecord::new(id, code, at(millis))])
    }

    #[tokio::test]
    async fn test_older_status_is_rejected() {
        let (aggregator, _, _) = setup();
        aggregator.available(&NodeSet::from([node("sh-1", &["a"])])).await;

        aggregator
            .status_update(&status("sh-1", StatusCode::Critical, 200))
            .await
            .unwrap();
        aggregator
            .status_update(&status("sh-1", StatusCode::Ok, 100))
            .await
            .unwrap();

        let stored = aggregator.status(&ResourceId::from("sh-1")).await.unwrap();
        assert_eq!(stored.code, StatusCode::Critical);
        assert_eq!(stored.modified_at, at(200));
    }

    #[tokio::test]
    async fn test_equal_timestamp_overwrites() {
        let (aggregator, _, platform) = setup();
        aggregator.available(&NodeSet::from([node("sh-1", &["a"])])).await;

        aggregator
            .status_update(&status("sh-1", StatusCode::Ok, 100))
            .await
            .unwrap();
        aggregator
            .status_update(&status("sh-1", StatusCode::Warning, 100))
            .await
            .unwrap();

        let stored = aggregator.status(&ResourceId::from("sh-1")).await.unwrap();
        assert_eq!(stored.code, StatusCode::Warning);
        assert_eq!(platform.submissions(), 2);
    }

    #[tokio::test]
    async fn test_status_for_unknown_resource_submits_nothing() {
        let (aggregator, hardware, platform) = setup();

        aggregator
            .status_update(&status("sh-1", StatusCode::Ok, 100))
            .await
            .unwrap();

        assert_eq!(platform.submissions(), 0);
        assert_eq!(hardware.alert_calls(), 0);
        assert!(aggregator.is_empty().await);
    }

    #[tokio::test]
    async fn test_alerts_become_value_meta() {
        let (aggregator, hardware, platform) = setup();
        hardware.set_alerts(
            "sh-1",
            AlertMeta::from([(
                "/rest/alerts/7".to_string(),
                "https://ov#/activity/r/rest/alerts/7".to_string(),
            )]),
        );
        aggregator.available(&NodeSet::from([node("sh-1", &["a"])])).await;

        aggregator
            .status_update(&status("sh-1", StatusCode::Critical, 100))
            .await
            .unwrap();

        let batch = &platform.batches()[0];
        assert_eq!(batch.len(), 1);
        assert!((batch[0].value - 2.0).abs() < f64::EPSILON);
        assert_eq!(batch[0].value_meta.len(), 1);
        assert_eq!(
            aggregator.meta(&ResourceId::from("sh-1")).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_available_merges_and_unavailable_evicts() {
        let (aggregator, _, _) = setup();
        let id = ResourceId::from("sh-1");

        aggregator.available(&NodeSet::from([node("sh-1", &["a"])])).await;
        aggregator.available(&NodeSet::from([node("sh-1", &["b"])])).await;
        assert_eq!(
            aggregator.metric_names(&id).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        // Eviction is total even though the node still carries a metric.
        aggregator.unavailable(&NodeSet::from([node("sh-1", &["a"])])).await;
        assert!(aggregator.metric_names(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_submit_failure_propagates_on_status_update() {
        let (aggregator, _, platform) = setup();
        aggregator.available(&NodeSet::from([node("sh-1", &["a"])])).await;
        platform.fail_next(1);

        let result = aggregator
            .status_update(&status("sh-1", StatusCode::Ok, 100))
            .await;

        assert_matches!(result, Err(Error::Submit(_)));
    }

    #[tokio::test]
    async fn test_alert_failure_propagates() {
        let (aggregator, hardware, platform) = setup();
        aggregator.available(&NodeSet::from([node("sh-1", &["a"])])).await;
        hardware.fail_next(
            Operation::Alerts,
            ovm_hardware_mock::Error::Unavailable("down".to_string()),
        );

        let result = aggregator
            .status_update(&status("sh-1", StatusCode::Warning, 100))
            .await;

        assert_matches!(result, Err(Error::Alerts { id, .. }) if id.as_str() == "sh-1");
        assert_eq!(platform.submissions(), 0);
    }

    #[tokio::test]
    async fn test_flush_skips_resources_without_status() {
        let (aggregator, _, platform) = setup();
        aggregator
            .available(&NodeSet::from([node("sh-1", &["a"]), node("sh-2", &["a", "b"])]))
            .await;

        assert_eq!(aggregator.flush().await.unwrap(), 0);
        assert_eq!(platform.submissions(), 0);

        aggregator
            .status_update(&status("sh-2", StatusCode::Ok, 100))
            .await
            .unwrap();
        assert_eq!(aggregator.flush().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stop_without_publish() {
        let (aggregator, _, _) = setup();
        aggregator.stop().await;
        aggregator.stop().await;
    }
}
