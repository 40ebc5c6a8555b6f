use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use ovm_eventbus::NodeSubscriber;
use ovm_hardware_mock::{MockHardware, Operation};
use ovm_keeper::{Aggregator, AggregatorOptions, Error};
use ovm_metrics_platform_memory::MemoryMetricsPlatform;
use ovm_model::{
    MetricDescriptor, Node, NodeSet, ResourceId, StatusCode, StatusRecord, StatusSet,
};

fn two_metric_node() -> Node {
    two_metric_node_for("sh-1")
}

fn two_metric_node_for(id: &str) -> Node {
    Node::new(
        id,
        [
            MetricDescriptor::new(
                "metricA",
                BTreeMap::from([("service".to_string(), "ironic".to_string())]),
            ),
            MetricDescriptor::new("metricB", BTreeMap::new()),
        ]
        .into_iter()
        .collect(),
    )
}

fn aggregator(
    batch_interval: Duration,
) -> (
    Arc<Aggregator<MockHardware, MemoryMetricsPlatform>>,
    Arc<MemoryMetricsPlatform>,
) {
    let (aggregator, _, platform) = aggregator_with_hardware(batch_interval);
    (aggregator, platform)
}

fn aggregator_with_hardware(
    batch_interval: Duration,
) -> (
    Arc<Aggregator<MockHardware, MemoryMetricsPlatform>>,
    Arc<MockHardware>,
    Arc<MemoryMetricsPlatform>,
) {
    let hardware = Arc::new(MockHardware::new());
    let platform = Arc::new(MemoryMetricsPlatform::new());
    let aggregator = Arc::new(Aggregator::new(AggregatorOptions {
        hardware: hardware.clone(),
        platform: platform.clone(),
        batch_interval,
    }));
    (aggregator, hardware, platform)
}

const RESOURCES: [&str; 3] = ["sh-1", "sh-2", "sh-3"];

async fn three_known_resources(aggregator: &Aggregator<MockHardware, MemoryMetricsPlatform>) {
    aggregator
        .available(&RESOURCES.into_iter().map(two_metric_node_for).collect::<NodeSet>())
        .await;
}

fn warnings_for_all(millis: i64) -> StatusSet {
    RESOURCES
        .into_iter()
        .map(|id| {
            StatusRecord::new(
                id,
                StatusCode::Warning,
                Utc.timestamp_millis_opt(millis).unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_ok_status_submits_one_measurement_per_metric() {
    let (aggregator, platform) = aggregator(Duration::from_secs(60));

    aggregator
        .available(&NodeSet::from([two_metric_node()]))
        .await;
    aggregator
        .status_update(&StatusSet::from([StatusRecord::new(
            "sh-1",
            StatusCode::Ok,
            Utc.timestamp_millis_opt(100).unwrap(),
        )]))
        .await
        .unwrap();

    let batches = platform.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    for measurement in &batches[0] {
        assert!(measurement.value.abs() < f64::EPSILON);
        assert!(measurement.value_meta.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_loop_republishes_and_never_sends_empty() {
    let (aggregator, platform) = aggregator(Duration::from_secs(60));
    aggregator.publish().await;

    // Nothing known yet: the first tick must not submit.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(platform.submissions(), 0);

    aggregator
        .available(&NodeSet::from([two_metric_node()]))
        .await;
    aggregator
        .status_update(&StatusSet::from([StatusRecord::new(
            "sh-1",
            StatusCode::Warning,
            Utc::now(),
        )]))
        .await
        .unwrap();
    assert_eq!(platform.submissions(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(platform.submissions(), 2);
    assert_eq!(platform.batches()[1].len(), 2);

    aggregator.stop().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(platform.submissions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_batch_failure_does_not_stop_the_loop() {
    let (aggregator, platform) = aggregator(Duration::from_secs(10));
    aggregator
        .available(&NodeSet::from([two_metric_node()]))
        .await;
    aggregator
        .status_update(&StatusSet::from([StatusRecord::new(
            "sh-1",
            StatusCode::Ok,
            Utc::now(),
        )]))
        .await
        .unwrap();
    aggregator.publish().await;

    platform.fail_next(1);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(platform.submissions(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(platform.submissions(), 2);

    aggregator.stop().await;
}

#[tokio::test]
async fn test_status_set_for_several_resources_submits_once() {
    let (aggregator, hardware, platform) = aggregator_with_hardware(Duration::from_secs(60));
    three_known_resources(&aggregator).await;

    aggregator
        .status_update(&warnings_for_all(100))
        .await
        .unwrap();

    assert_eq!(platform.submissions(), 1);
    let batch = &platform.batches()[0];
    assert_eq!(batch.len(), 6);
    assert_eq!(hardware.alert_calls(), 3);
    for id in RESOURCES {
        let stored = aggregator.status(&ResourceId::from(id)).await.unwrap();
        assert_eq!(stored.code, StatusCode::Warning);
    }
}

#[tokio::test]
async fn test_alert_failure_mid_set_stores_and_submits_nothing() {
    let (aggregator, hardware, platform) = aggregator_with_hardware(Duration::from_secs(60));
    three_known_resources(&aggregator).await;
    hardware.pass_next(Operation::Alerts);
    hardware.fail_next(
        Operation::Alerts,
        ovm_hardware_mock::Error::Unavailable("connection reset".to_string()),
    );

    let result = aggregator.status_update(&warnings_for_all(100)).await;

    assert_matches!(result, Err(Error::Alerts { .. }));
    assert_eq!(hardware.alert_calls(), 2);
    assert_eq!(platform.submissions(), 0);
    for id in RESOURCES {
        assert!(aggregator.status(&ResourceId::from(id)).await.is_none());
    }
    assert_eq!(aggregator.flush().await.unwrap(), 0);

    // The same set goes through once the appliance answers again.
    aggregator
        .status_update(&warnings_for_all(100))
        .await
        .unwrap();
    assert_eq!(platform.submissions(), 1);
    assert_eq!(platform.batches()[0].len(), 6);
}
