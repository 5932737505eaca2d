//! Flow aggregator (C2).
//!
//! One task per canonical five-tuple. Bytes are tallied into
//! `bytes_a_to_b`/`bytes_b_to_a` where "A" is whichever endpoint sent the
//! very first event; every subsequent event is compared against that
//! latched endpoint, not recomputed. Two fan-out [`UsageEvent`]s are
//! derived per event from the `user()`/`local()` predicates on the
//! *network* endpoints only — transport ports never factor into billing.

use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::classify::Classifier;
use crate::model::{FiveTuple, FlowEvent, FlowLogRow, UsageEvent, UsageKind};
use crate::store::{now, Store};
use std::sync::Arc;

/// Bound on a flow task's mailbox. Not configurable (§4's note: a
/// configuration-free constant chosen for back-pressure without starving
/// bursts).
pub const MAILBOX_CAPACITY: usize = 256;

pub type FlowMailbox = mpsc::Sender<FlowEvent>;

struct DirectionA {
    ip: IpAddr,
    port: u16,
}

struct FlowState {
    bytes_a_to_b: u64,
    bytes_b_to_a: u64,
    interval_start: chrono::DateTime<chrono::Utc>,
    direction_a: DirectionA,
}

/// Spawn the task owning one canonical five-tuple. Returns the mailbox the
/// caller (C8, via the canonical-tuple map) should hold; the task exits on
/// its own after one full idle flush interval, or immediately on shutdown.
pub fn spawn(
    canonical: FiveTuple,
    classifier: Arc<Classifier>,
    store: Arc<dyn Store>,
    usage_tx: mpsc::Sender<UsageEvent>,
    flow_log_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> FlowMailbox {
    let (tx, mut rx) = mpsc::channel::<FlowEvent>(MAILBOX_CAPACITY);

    tokio::spawn(async move {
        let mut state: Option<FlowState> = None;
        let mut ticker = tokio::time::interval(flow_log_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate; skip it

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    if let Some(s) = state.take() {
                        flush(&store, canonical, &s).await;
                    }
                    break;
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            handle_event(&mut state, &classifier, canonical, event, &usage_tx).await;
                        }
                        None => {
                            // All senders dropped (supervisor map entry removed
                            // from elsewhere); flush what remains and exit.
                            if let Some(s) = state.take() {
                                flush(&store, canonical, &s).await;
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    match &state {
                        None => continue,
                        Some(s) if s.bytes_a_to_b == 0 && s.bytes_b_to_a == 0 => {
                            debug!(?canonical, "flow idle, reclaiming");
                            break;
                        }
                        Some(s) => {
                            flush(&store, canonical, s).await;
                            state = Some(FlowState {
                                bytes_a_to_b: 0,
                                bytes_b_to_a: 0,
                                interval_start: now(),
                                direction_a: DirectionA {
                                    ip: s.direction_a.ip,
                                    port: s.direction_a.port,
                                },
                            });
                        }
                    }
                }
            }
        }
    });

    tx
}

async fn handle_event(
    state: &mut Option<FlowState>,
    classifier: &Classifier,
    canonical: FiveTuple,
    event: FlowEvent,
    usage_tx: &mpsc::Sender<UsageEvent>,
) {
    let s = state.get_or_insert_with(|| {
        let (ip, port) = event.five_tuple.source_endpoint();
        FlowState {
            bytes_a_to_b: 0,
            bytes_b_to_a: 0,
            interval_start: now(),
            direction_a: DirectionA { ip, port },
        }
    });

    let (src_ip, src_port) = event.five_tuple.source_endpoint();
    if src_ip == s.direction_a.ip && src_port == s.direction_a.port {
        s.bytes_a_to_b += event.bytes;
    } else {
        s.bytes_b_to_a += event.bytes;
    }

    emit_usage_events(classifier, &canonical, &event, usage_tx).await;
}

/// Derive up to two [`UsageEvent`]s for the subscriber endpoint(s) of this
/// packet. Only network endpoints participate in `user()`/`local()`.
async fn emit_usage_events(
    classifier: &Classifier,
    canonical: &FiveTuple,
    event: &FlowEvent,
    usage_tx: &mpsc::Sender<UsageEvent>,
) {
    let t = event.five_tuple;
    let _ = canonical; // billed on the observed tuple's endpoints, not the canonical key

    let src_is_user = classifier.is_user(t.src_ip);
    let dst_is_user = classifier.is_user(t.dst_ip);

    if src_is_user {
        let kind = usage_kind(classifier, t.dst_ip, true);
        send_usage(usage_tx, t.src_ip, kind, event.bytes).await;
    }
    if dst_is_user {
        let kind = usage_kind(classifier, t.src_ip, false);
        send_usage(usage_tx, t.dst_ip, kind, event.bytes).await;
    }
}

fn usage_kind(classifier: &Classifier, peer_ip: IpAddr, is_upload: bool) -> UsageKind {
    let local = classifier.is_local(peer_ip);
    match (local, is_upload) {
        (true, true) => UsageKind::LocalUp,
        (true, false) => UsageKind::LocalDown,
        (false, true) => UsageKind::ExternUp,
        (false, false) => UsageKind::ExternDown,
    }
}

async fn send_usage(usage_tx: &mpsc::Sender<UsageEvent>, ip: IpAddr, kind: UsageKind, bytes: u64) {
    if usage_tx.send(UsageEvent { ip, kind, bytes }).await.is_err() {
        debug!(%ip, "subscriber aggregator mailbox closed, dropping usage event");
    }
}

async fn flush(store: &Arc<dyn Store>, canonical: FiveTuple, state: &FlowState) {
    // `state.bytes_a_to_b`/`bytes_b_to_a` are tallied relative to
    // `direction_a`, the first observed packet's source — which need not be
    // the canonical tuple's `src_ip`/`src_port` (canonicalization picks the
    // lexicographically lower endpoint). Reorient before writing so the row
    // is always labeled against `canonical.src_ip`.
    let (bytes_a_to_b, bytes_b_to_a) =
        if state.direction_a.ip == canonical.src_ip && state.direction_a.port == canonical.src_port {
            (state.bytes_a_to_b, state.bytes_b_to_a)
        } else {
            (state.bytes_b_to_a, state.bytes_a_to_b)
        };

    store
        .log_flow(FlowLogRow {
            interval_start: state.interval_start,
            interval_stop: now(),
            five_tuple: canonical,
            bytes_a_to_b,
            bytes_b_to_a,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake_store::FakeStore;
    use std::time::Duration as StdDuration;

    fn tuple(a: &str, ap: u16, b: &str, bp: u16) -> FiveTuple {
        FiveTuple {
            src_ip: a.parse().unwrap(),
            dst_ip: b.parse().unwrap(),
            src_port: ap,
            dst_port: bp,
            protocol: 6,
        }
    }

    #[tokio::test]
    async fn folds_bidirectional_traffic_into_one_flow_log_row() {
        let classifier = Arc::new(Classifier::new(
            vec!["10.45.0.0/16".parse().unwrap()],
            vec![],
        ));
        let fake = Arc::new(FakeStore::new());
        let store: Arc<dyn Store> = fake.clone();

        let (usage_tx, mut usage_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let t_ab = tuple("10.45.0.7", 1000, "8.8.8.8", 2000);
        let canonical = t_ab.canonical();

        let mailbox = spawn(
            canonical,
            classifier,
            Arc::clone(&store),
            usage_tx,
            StdDuration::from_millis(30),
            shutdown_rx,
        );

        mailbox
            .send(FlowEvent {
                five_tuple: t_ab,
                bytes: 600,
            })
            .await
            .unwrap();
        mailbox
            .send(FlowEvent {
                five_tuple: t_ab.reversed(),
                bytes: 400,
            })
            .await
            .unwrap();

        // drain usage events so the aggregator doesn't block
        for _ in 0..2 {
            usage_rx.recv().await;
        }

        tokio::time::sleep(StdDuration::from_millis(80)).await;

        let rows = fake.flow_log_rows().await;
        assert_eq!(rows.len(), 1);
        let row = rows[0];
        if canonical.src_ip == t_ab.src_ip {
            assert_eq!(row.bytes_a_to_b, 600);
            assert_eq!(row.bytes_b_to_a, 400);
        } else {
            assert_eq!(row.bytes_a_to_b, 400);
            assert_eq!(row.bytes_b_to_a, 600);
        }
    }

    #[tokio::test]
    async fn reclaims_after_idle_tick_with_no_traffic() {
        let classifier = Arc::new(Classifier::new(vec![], vec![]));
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let (usage_tx, _usage_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let t = tuple("10.45.0.7", 1000, "8.8.8.8", 2000);
        let canonical = t.canonical();
        let mailbox = spawn(
            canonical,
            classifier,
            store,
            usage_tx,
            StdDuration::from_millis(20),
            shutdown_rx,
        );

        // never send anything; after idle tick the task exits and drops rx,
        // so a subsequent send should fail.
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        assert!(mailbox.send(FlowEvent { five_tuple: t, bytes: 1 }).await.is_err());
    }
}
