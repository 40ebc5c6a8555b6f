use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use ovm_eventbus::{NodeSubscriber, StatusSubscriber, SubscriberError};
use ovm_hardware_mock::{MockHardware, Operation};
use ovm_model::{CrashError, MetricDescriptor, MetricSet, Node, NodeSet, ResourceId, StatusCode, StatusSet};
use ovm_scmb::{
    BrokerEndpoint, ChannelError, EXCHANGE_NAME, Error, ListenerState, PushListener,
    PushListenerOptions, ROUTING_KEY,
};
use ovm_scmb_memory::MemoryPushChannel;
use tokio::sync::mpsc;

struct Forwarder {
    sender: mpsc::UnboundedSender<StatusSet>,
}

#[async_trait]
impl StatusSubscriber for Forwarder {
    fn name(&self) -> &'static str {
        "forwarder"
    }

    async fn status_update(&self, statuses: &StatusSet) -> Result<(), SubscriberError> {
        self.sender.send(statuses.clone())?;
        Ok(())
    }
}

struct Harness {
    listener: PushListener<MockHardware>,
    hardware: Arc<MockHardware>,
    channel: MemoryPushChannel,
    crashes: mpsc::UnboundedReceiver<CrashError>,
    updates: mpsc::UnboundedReceiver<StatusSet>,
}

fn harness(max_retry_attempts: u32) -> Harness {
    let hardware = Arc::new(MockHardware::new());
    let channel = MemoryPushChannel::new();
    let (crash_tx, crashes) = mpsc::unbounded_channel();
    let (update_tx, updates) = mpsc::unbounded_channel();

    let listener = PushListener::new(PushListenerOptions {
        hardware: hardware.clone(),
        channel: Arc::new(channel.clone()),
        endpoint: BrokerEndpoint::for_host("oneview.example"),
        max_retry_attempts,
        reconnect_delay: Duration::from_secs(1),
        crash_callback: Arc::new(move |e| {
            let _ = crash_tx.send(e);
        }),
    });
    listener.subscribe(Arc::new(Forwarder { sender: update_tx }));

    Harness {
        listener,
        hardware,
        channel,
        crashes,
        updates,
    }
}

fn node(id: &str) -> Node {
    Node::new(
        id,
        MetricSet::from([MetricDescriptor::new("oneview.server_hardware", BTreeMap::new())]),
    )
}

fn message(uuid: &str, status: &str) -> String {
    format!(
        r#"{{"resource": {{"uuid": "{uuid}", "status": "{status}", "modified": "2016-03-03T18:02:41.379Z"}}}}"#
    )
}

async fn wait_for_state(listener: &PushListener<MockHardware>, expected: ListenerState) {
    listener
        .watch_state()
        .wait_for(|state| *state == expected)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unmonitored_message_is_ignored() {
    let mut h = harness(3);
    h.listener.available(&NodeSet::from([node("sh-1")])).await;
    h.listener.publish().await;
    wait_for_state(&h.listener, ListenerState::Consuming).await;

    assert_eq!(
        h.channel.bindings(),
        vec![(EXCHANGE_NAME.to_string(), ROUTING_KEY.to_string())]
    );

    assert!(h.channel.publish("scmb.server-hardware.Updated.sh-9", message("sh-9", "Critical")));
    assert!(h.channel.publish("scmb.server-hardware.Updated.sh-1", message("sh-1", "Critical")));

    let update = h.updates.recv().await.unwrap();
    assert_eq!(update.len(), 1);
    let record = update.iter().next().unwrap();
    assert_eq!(record.id, ResourceId::from("sh-1"));
    assert_eq!(record.code, StatusCode::Critical);
    assert_eq!(record.modified_at.timestamp_millis(), 1_457_028_161_379);

    h.listener.stop().await;
    assert_eq!(h.listener.state(), ListenerState::Stopped);
    assert!(h.updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_status_string_crashes_but_keeps_consuming() {
    let mut h = harness(3);
    h.listener.available(&NodeSet::from([node("sh-1")])).await;
    h.listener.publish().await;
    wait_for_state(&h.listener, ListenerState::Consuming).await;

    h.channel.publish("scmb.server-hardware.Updated.sh-1", message("sh-1", "Broken"));
    h.channel.publish("scmb.server-hardware.Updated.sh-1", "not json");
    h.channel.publish("scmb.server-hardware.Updated.sh-1", message("sh-1", "OK"));

    let crash = h.crashes.recv().await.unwrap();
    assert_matches!(crash.downcast_ref::<Error>(), Some(Error::StatusMapping { .. }));

    let update = h.updates.recv().await.unwrap();
    assert!(update.iter().all(|record| record.code == StatusCode::Ok));
    assert_eq!(h.listener.state(), ListenerState::Consuming);

    h.listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhaustion() {
    let mut h = harness(2);
    for _ in 0..3 {
        h.channel
            .fail_next_connect(ChannelError::Transport("connection refused".into()));
    }

    h.listener.publish().await;

    let crash = h.crashes.recv().await.unwrap();
    assert_matches!(
        crash.downcast_ref::<Error>(),
        Some(Error::ConnectionPermanentlyFailed)
    );
    // The first transport failure reloads certificates for free, the next
    // two spend the budget.
    assert_eq!(h.channel.connect_attempts(), 3);
    assert_eq!(h.hardware.trust_material_calls(), 3);
    assert_eq!(h.listener.state(), ListenerState::Failed);

    h.listener.stop().await;
    assert_eq!(h.listener.state(), ListenerState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_other_failures_spend_budget_immediately() {
    let mut h = harness(2);
    h.channel
        .fail_next_bind(ChannelError::Other("queue declare refused".into()));
    h.hardware.fail_next(
        Operation::TrustMaterial,
        ovm_hardware_mock::Error::Unavailable("busy".into()),
    );

    h.listener.publish().await;

    let crash = h.crashes.recv().await.unwrap();
    assert_matches!(
        crash.downcast_ref::<Error>(),
        Some(Error::ConnectionPermanentlyFailed)
    );
    assert_eq!(h.channel.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_consume_restores_free_reload() {
    let h = harness(1);
    h.channel
        .fail_next_connect(ChannelError::Transport("connection reset".into()));

    h.listener.publish().await;
    wait_for_state(&h.listener, ListenerState::Consuming).await;
    assert_eq!(h.channel.connect_attempts(), 2);

    // With a budget of one, a second paid retry would fail the listener.
    for expected_attempts in [3, 4] {
        assert!(h.channel.break_session(ChannelError::Transport("heartbeat lost".into())));
        while h.channel.connect_attempts() < expected_attempts {
            tokio::task::yield_now().await;
        }
        wait_for_state(&h.listener, ListenerState::Consuming).await;
    }

    assert!(h.channel.is_consuming());
    h.listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_fatal() {
    let mut h = harness(5);
    h.hardware.fail_next(
        Operation::ValidateTrustMaterial,
        ovm_hardware_mock::Error::Authentication,
    );

    h.listener.publish().await;

    let crash = h.crashes.recv().await.unwrap();
    assert_matches!(
        crash.downcast_ref::<Error>(),
        Some(Error::TrustMaterial {
            authentication: true,
            ..
        })
    );
    assert_eq!(h.channel.connect_attempts(), 0);
    assert_eq!(h.listener.state(), ListenerState::Failed);

    h.listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_trust_material_write_failure_is_fatal() {
    let mut h = harness(3);
    h.hardware.fail_next(
        Operation::TrustMaterial,
        ovm_hardware_mock::Error::LocalIo("read-only file system".into()),
    );

    h.listener.publish().await;

    let crash = h.crashes.recv().await.unwrap();
    assert_matches!(
        crash.downcast_ref::<Error>(),
        Some(Error::TrustMaterial {
            authentication: false,
            local_io: true,
            ..
        })
    );
    assert_eq!(h.hardware.trust_material_calls(), 1);
    assert_eq!(h.channel.connect_attempts(), 0);
    assert_eq!(h.listener.state(), ListenerState::Failed);
    assert!(h.crashes.try_recv().is_err());

    h.listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_consuming_session() {
    let h = harness(3);
    h.listener.publish().await;
    wait_for_state(&h.listener, ListenerState::Consuming).await;
    assert!(h.channel.is_consuming());

    h.listener.stop().await;

    assert_eq!(h.channel.sessions_closed(), 1);
    assert!(!h.channel.is_consuming());
    assert_eq!(h.listener.state(), ListenerState::Stopped);
}

#[tokio::test]
async fn test_tracking_follows_metric_sets() {
    let h = harness(1);
    h.listener
        .available(&NodeSet::from([node("sh-1"), node("sh-2")]))
        .await;
    h.listener
        .unavailable(&NodeSet::from([Node::new("sh-2", MetricSet::new())]))
        .await;

    assert!(h.listener.is_monitored(&ResourceId::from("sh-1")));
    assert!(!h.listener.is_monitored(&ResourceId::from("sh-2")));
    assert_eq!(h.listener.state(), ListenerState::Disconnected);
}
