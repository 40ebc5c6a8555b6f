use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use ovm_election::{DEFAULT_HEARTBEAT_INTERVAL, Error, LeadershipGate, LeadershipGateOptions};
use ovm_election_memory::{Error as MemoryError, MemoryElection, MemoryElectionHub};

const GROUP: &str = "oneview-monasca";

fn gate(hub: &MemoryElectionHub, id: &str) -> (LeadershipGate<MemoryElection>, Arc<AtomicUsize>) {
    let (gate, wins, _) = gate_with_losses(hub, id);
    (gate, wins)
}

fn gate_with_losses(
    hub: &MemoryElectionHub,
    id: &str,
) -> (
    LeadershipGate<MemoryElection>,
    Arc<AtomicUsize>,
    Arc<AtomicUsize>,
) {
    let wins = Arc::new(AtomicUsize::new(0));
    let losses = Arc::new(AtomicUsize::new(0));
    let won = wins.clone();
    let lost = losses.clone();
    let gate = LeadershipGate::new(LeadershipGateOptions {
        election: Arc::new(hub.member_with_id(id)),
        group: GROUP.to_string(),
        heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        on_elected: Arc::new(move || {
            won.fetch_add(1, Ordering::SeqCst);
        }),
        on_lost: Arc::new(move || {
            lost.fetch_add(1, Ordering::SeqCst);
        }),
    });
    (gate, wins, losses)
}

async fn heartbeat() {
    tokio::time::sleep(Duration::from_millis(1500)).await;
}

#[tokio::test(start_paused = true)]
async fn test_single_member_runs_task_once() {
    let hub = MemoryElectionHub::new();
    let (gate, wins) = gate(&hub, "oneviewd-a");

    gate.start().await.unwrap();
    heartbeat().await;
    heartbeat().await;

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert!(gate.is_leader());
    assert_eq!(hub.members(GROUP), vec!["oneviewd-a".to_string()]);

    gate.stop().await;
    gate.stop().await;
    assert!(!gate.is_leader());
    assert!(hub.members(GROUP).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_step_down_hands_over_and_back() {
    let hub = MemoryElectionHub::new();
    let (first, first_wins) = gate(&hub, "oneviewd-a");
    let (second, second_wins) = gate(&hub, "oneviewd-b");

    first.start().await.unwrap();
    second.start().await.unwrap();
    heartbeat().await;
    assert_eq!(first_wins.load(Ordering::SeqCst), 1);
    assert_eq!(second_wins.load(Ordering::SeqCst), 0);

    first.step_down().await.unwrap();
    heartbeat().await;
    assert!(!first.is_leader());
    assert!(second.is_leader());
    assert_eq!(second_wins.load(Ordering::SeqCst), 1);

    second.stop().await;
    heartbeat().await;
    assert!(first.is_leader());
    assert_eq!(first_wins.load(Ordering::SeqCst), 2);

    first.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_clears_leadership() {
    let hub = MemoryElectionHub::new();
    let (first, first_wins, first_losses) = gate_with_losses(&hub, "oneviewd-a");
    let (second, second_wins, second_losses) = gate_with_losses(&hub, "oneviewd-b");

    first.start().await.unwrap();
    second.start().await.unwrap();
    heartbeat().await;
    assert!(first.is_leader());

    assert_eq!(hub.expire_leader(GROUP).as_deref(), Some("oneviewd-a"));
    heartbeat().await;

    assert!(!first.is_leader());
    assert_eq!(first_losses.load(Ordering::SeqCst), 1);
    assert_eq!(first_wins.load(Ordering::SeqCst), 1);
    assert!(second.is_leader());
    assert_eq!(second_wins.load(Ordering::SeqCst), 1);
    assert_eq!(second_losses.load(Ordering::SeqCst), 0);

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_unreachable_backend_fails_start() {
    let hub = MemoryElectionHub::new();
    hub.set_unreachable(true);
    let (gate, wins) = gate(&hub, "oneviewd-a");

    let result = gate.start().await;

    assert_matches!(result, Err(Error::Election(MemoryError::Unreachable)));
    assert_eq!(wins.load(Ordering::SeqCst), 0);
    gate.stop().await;
}

#[tokio::test]
async fn test_cannot_restart_stopped_gate() {
    let hub = MemoryElectionHub::new();
    let (gate, _) = gate(&hub, "oneviewd-a");

    gate.stop().await;

    assert_matches!(gate.start().await, Err(Error::AlreadyStarted));
}
