use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ovm_eventbus::{EventBus, EventBusOptions, NodeSubscriber, Priority};
use ovm_model::{MetricDescriptor, Node, NodeSet};
use tokio::time::Instant;

type Journal = Arc<Mutex<Vec<(&'static str, &'static str, Instant)>>>;

struct Stamp {
    name: &'static str,
    journal: Journal,
    work: Duration,
}

#[async_trait]
impl NodeSubscriber for Stamp {
    fn name(&self) -> &str {
        self.name
    }

    async fn available(&self, _nodes: &NodeSet) {
        tokio::time::sleep(self.work).await;
        self.journal
            .lock()
            .unwrap()
            .push((self.name, "available", Instant::now()));
    }

    async fn unavailable(&self, _nodes: &NodeSet) {
        tokio::time::sleep(self.work).await;
        self.journal
            .lock()
            .unwrap()
            .push((self.name, "unavailable", Instant::now()));
    }
}

fn nodes() -> NodeSet {
    NodeSet::from([Node::new(
        "sh-1",
        [MetricDescriptor::new("oneview.server_hardware", BTreeMap::new())]
            .into_iter()
            .collect(),
    )])
}

fn stamped(journal: &Journal, name: &str, event: &str) -> Instant {
    journal
        .lock()
        .unwrap()
        .iter()
        .find(|(n, e, _)| *n == name && *e == event)
        .map(|(_, _, at)| *at)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_high_tier_finishes_before_low_on_available() {
    let journal = Journal::default();
    let bus = EventBus::new(EventBusOptions::default());

    // A slow high-priority subscriber must still be done before the low tier runs.
    bus.subscribe(
        Arc::new(Stamp {
            name: "keeper",
            journal: journal.clone(),
            work: Duration::from_secs(5),
        }),
        Priority::High,
    )
    .await;
    bus.subscribe(
        Arc::new(Stamp {
            name: "puller",
            journal: journal.clone(),
            work: Duration::ZERO,
        }),
        Priority::Low,
    )
    .await;

    bus.available(&nodes()).await;

    assert!(stamped(&journal, "keeper", "available") < stamped(&journal, "puller", "available"));
}

#[tokio::test(start_paused = true)]
async fn test_low_tier_finishes_before_high_on_unavailable() {
    let journal = Journal::default();
    let bus = EventBus::new(EventBusOptions::default());

    bus.subscribe(
        Arc::new(Stamp {
            name: "keeper",
            journal: journal.clone(),
            work: Duration::ZERO,
        }),
        Priority::High,
    )
    .await;
    bus.subscribe(
        Arc::new(Stamp {
            name: "scmb",
            journal: journal.clone(),
            work: Duration::from_secs(5),
        }),
        Priority::Low,
    )
    .await;

    bus.available(&nodes()).await;
    bus.unavailable(&nodes()).await.unwrap();

    assert!(
        stamped(&journal, "scmb", "unavailable") < stamped(&journal, "keeper", "unavailable")
    );
}

#[tokio::test(start_paused = true)]
async fn test_tiers_are_separated_by_settle_delay() {
    let journal = Journal::default();
    let bus = EventBus::new(EventBusOptions {
        settle_delay: Duration::from_secs(1),
        ..EventBusOptions::default()
    });

    for (name, priority) in [("keeper", Priority::High), ("puller", Priority::Low)] {
        bus.subscribe(
            Arc::new(Stamp {
                name,
                journal: journal.clone(),
                work: Duration::ZERO,
            }),
            priority,
        )
        .await;
    }

    bus.available(&nodes()).await;

    let gap = stamped(&journal, "puller", "available") - stamped(&journal, "keeper", "available");
    assert!(gap >= Duration::from_secs(1));
}
