//! End-to-end tests driving the supervisor (C8) with an in-memory store
//! and effector, the same way `server/tests/integration.rs` drives a real
//! axum server against an in-memory SQLite pool in the teacher repo —
//! no network, no subprocess, but the real task graph.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use haulage::classify::{Classifier, DecodedPacket, NetworkLayer, TransportLayer};
use haulage::effector::fake_effector::FakeEffector;
use haulage::effector::PacketFilterEffector;
use haulage::store::fake_store::{FakeAccount, FakeStore};
use haulage::store::Store;
use haulage::supervisor::Supervisor;
/// A scripted [`PacketSource`] that yields a fixed sequence of packets and
/// then ends, modeling the capture collaborator for tests that drive the
/// real ingress loop instead of calling aggregators directly.
struct ScriptedSource {
    packets: std::vec::IntoIter<DecodedPacket>,
}

impl ScriptedSource {
    fn new(packets: Vec<DecodedPacket>) -> Self {
        Self {
            packets: packets.into_iter(),
        }
    }
}

#[async_trait::async_trait]
impl haulage::capture::PacketSource for ScriptedSource {
    async fn recv(&mut self) -> Option<DecodedPacket> {
        self.packets.next()
    }
}

fn tcp_packet(src: &str, sport: u16, dst: &str, dport: u16, payload_len: u16) -> DecodedPacket {
    DecodedPacket {
        link: None,
        network: Some(NetworkLayer::V4 {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            protocol: 6,
            payload_len,
        }),
        transport: Some(TransportLayer::Tcp {
            src_port: sport,
            dst_port: dport,
        }),
        transport_payload: Vec::new(),
    }
}

fn subscriber_ip() -> IpAddr {
    "10.45.0.7".parse().unwrap()
}

/// Scenario 1 (§8): single subscriber, no threshold crossed, one FlowLog
/// row after one `flowLogInterval`, `bridged` stays true.
#[tokio::test]
async fn single_subscriber_under_threshold_commits_usage_and_flow_log() {
    let store = Arc::new(FakeStore::new());
    store
        .seed_subscriber(
            subscriber_ip(),
            FakeAccount {
                imsi: "001010000000001".to_string(),
                raw_up: 0,
                raw_down: 0,
                data_balance: 100_000_000,
                bridged: true,
            },
        )
        .await;

    let classifier = Classifier::new(vec!["10.45.0.0/16".parse().unwrap()], vec![]);
    let effector = Arc::new(FakeEffector::new());

    let (supervisor, status_rx) = Supervisor::new(
        store.clone() as Arc<dyn Store>,
        effector.clone() as Arc<dyn PacketFilterEffector>,
        classifier,
        Duration::from_millis(40),
        Duration::from_millis(40),
        Duration::from_secs(3600),
    );
    supervisor.start_enforcement(status_rx);

    let packets: Vec<DecodedPacket> = (0..10)
        .map(|_| tcp_packet("10.45.0.7", 54000, "8.8.8.8", 443, 1500))
        .collect();
    let source: Box<dyn haulage::capture::PacketSource> = Box::new(ScriptedSource::new(packets));

    let shutdown_tx = supervisor.shutdown_signal();
    supervisor
        .clone()
        .run_ingress_loop(source, shutdown_tx.subscribe())
        .await;

    // Give the flow/subscriber tasks time to commit on their timers.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let acct = store.account("001010000000001").await.expect("account exists");
    assert_eq!(acct.raw_up, 15_000);
    assert_eq!(acct.data_balance, 99_985_000);
    assert!(acct.bridged);
    assert!(effector.enable_calls.lock().unwrap().is_empty());

    let rows = store.flow_log_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].bytes_a_to_b + rows[0].bytes_b_to_a, 15_000);
}

/// Scenario 2 (§8): balance exhaustion through the full ingress path
/// triggers `enable_block` and flips `bridged` to false.
#[tokio::test]
async fn balance_exhaustion_through_ingress_triggers_block() {
    let store = Arc::new(FakeStore::new());
    store
        .seed_subscriber(
            subscriber_ip(),
            FakeAccount {
                imsi: "001010000000001".to_string(),
                raw_up: 0,
                raw_down: 0,
                data_balance: 20_000,
                bridged: true,
            },
        )
        .await;

    let classifier = Classifier::new(vec!["10.45.0.0/16".parse().unwrap()], vec![]);
    let effector = Arc::new(FakeEffector::new());

    let (supervisor, status_rx) = Supervisor::new(
        store.clone() as Arc<dyn Store>,
        effector.clone() as Arc<dyn PacketFilterEffector>,
        classifier,
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    );
    supervisor.start_enforcement(status_rx);

    let packets = vec![
        tcp_packet("10.45.0.7", 54000, "8.8.8.8", 443, 15_000),
        tcp_packet("10.45.0.7", 54000, "8.8.8.8", 443, 10_000),
    ];
    let source: Box<dyn haulage::capture::PacketSource> = Box::new(ScriptedSource::new(packets));

    let shutdown_tx = supervisor.shutdown_signal();
    supervisor
        .clone()
        .run_ingress_loop(source, shutdown_tx.subscribe())
        .await;

    // should_flush_now fires an immediate commit without waiting on any
    // timer, but the evaluator and usage router are separate tasks.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let acct = store.account("001010000000001").await.expect("account exists");
    assert_eq!(acct.data_balance, 0);
    assert!(!acct.bridged);
    assert_eq!(effector.enable_calls.lock().unwrap().as_slice(), &[subscriber_ip()]);
}

/// Scenario 6 (§8): startup reconciliation makes the kernel table match
/// persisted `bridged` state exactly once per subscriber.
#[tokio::test]
async fn startup_reconciliation_syncs_filter_table() {
    let store = FakeStore::new();
    let a: IpAddr = "10.45.0.1".parse().unwrap();
    let b: IpAddr = "10.45.0.2".parse().unwrap();
    store
        .seed_subscriber(
            a,
            FakeAccount {
                imsi: "A000000000000001".into(),
                raw_up: 0,
                raw_down: 0,
                data_balance: 1,
                bridged: true,
            },
        )
        .await;
    store
        .seed_subscriber(
            b,
            FakeAccount {
                imsi: "B000000000000001".into(),
                raw_up: 0,
                raw_down: 0,
                data_balance: 1,
                bridged: false,
            },
        )
        .await;

    let classifier = Classifier::new(vec![], vec![]);
    let effector = Arc::new(FakeEffector::new());
    let store: Arc<dyn Store> = Arc::new(store);

    let (supervisor, _status_rx) = Supervisor::new(
        store,
        effector.clone() as Arc<dyn PacketFilterEffector>,
        classifier,
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    );

    supervisor.reconcile_startup_state().await.unwrap();

    assert_eq!(effector.disable_calls.lock().unwrap().as_slice(), &[a]);
    assert_eq!(effector.enable_calls.lock().unwrap().as_slice(), &[b]);
}
