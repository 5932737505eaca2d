//! Subscriber aggregator (C3).
//!
//! One task per subscriber IP, tallying four byte buckets and flushing to
//! the persistence gateway either on a timer or as soon as outstanding
//! extern usage plausibly exhausts the cached balance — bounding
//! enforcement latency without having to poll the gateway on every event.

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use crate::enforcement::EnforcementHandle;
use crate::error::GatewayError;
use crate::model::{UsageEvent, UsageKind};
use crate::store::{self, Store};

pub const MAILBOX_CAPACITY: usize = 256;

pub type SubscriberMailbox = mpsc::Sender<UsageEvent>;

#[derive(Default)]
struct Buckets {
    local_up: u64,
    local_down: u64,
    extern_up: u64,
    extern_down: u64,
}

impl Buckets {
    fn all_zero(&self) -> bool {
        self.local_up == 0 && self.local_down == 0 && self.extern_up == 0 && self.extern_down == 0
    }

    fn add(&mut self, kind: UsageKind, bytes: u64) {
        match kind {
            UsageKind::LocalUp => self.local_up += bytes,
            UsageKind::LocalDown => self.local_down += bytes,
            UsageKind::ExternUp => self.extern_up += bytes,
            UsageKind::ExternDown => self.extern_down += bytes,
        }
    }

    fn reset(&mut self) {
        *self = Buckets::default();
    }
}

fn should_flush_now(outstanding: u64, cached_balance: i64) -> bool {
    cached_balance > 0 && outstanding as i64 >= cached_balance
}

/// Spawn the task owning one subscriber IP. `initial_balance` is the
/// `data_balance` read when the subscriber first became active in this
/// process's lifetime (§4.3: "the value read on task startup").
pub fn spawn(
    ip: IpAddr,
    initial_balance: i64,
    store: Arc<dyn Store>,
    enforcement: EnforcementHandle,
    user_log_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> SubscriberMailbox {
    let (tx, mut rx) = mpsc::channel::<UsageEvent>(MAILBOX_CAPACITY);

    tokio::spawn(async move {
        let mut buckets = Buckets::default();
        let mut cached_balance = initial_balance;
        let mut interval_start = store::now();
        let mut ticker = tokio::time::interval(user_log_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    if !buckets.all_zero() {
                        commit(&store, &enforcement, ip, &mut buckets, &mut cached_balance, &mut interval_start).await;
                    }
                    break;
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            buckets.add(event.kind, event.bytes);
                            let outstanding = buckets.extern_up + buckets.extern_down;
                            if should_flush_now(outstanding, cached_balance) {
                                commit(&store, &enforcement, ip, &mut buckets, &mut cached_balance, &mut interval_start).await;
                            }
                        }
                        None => {
                            if !buckets.all_zero() {
                                commit(&store, &enforcement, ip, &mut buckets, &mut cached_balance, &mut interval_start).await;
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if buckets.all_zero() {
                        debug!(%ip, "subscriber idle, reclaiming");
                        break;
                    }
                    commit(&store, &enforcement, ip, &mut buckets, &mut cached_balance, &mut interval_start).await;
                }
            }
        }
    });

    tx
}

/// Flush `local_*` (reported, unbilled) and `extern_*` (billed) buckets,
/// refresh the cached balance from the returned status, and hand the
/// status to C5. Local bytes are not separately persisted per §4.3 — only
/// extern usage crosses the gateway boundary in this deployment.
async fn commit(
    store: &Arc<dyn Store>,
    enforcement: &EnforcementHandle,
    ip: IpAddr,
    buckets: &mut Buckets,
    cached_balance: &mut i64,
    interval_start: &mut DateTime<Utc>,
) {
    let up = buckets.extern_up;
    let down = buckets.extern_down;

    match store.log_usage(ip, up, down, *interval_start).await {
        Ok(status) => {
            *cached_balance = status.current_balance;
            enforcement.evaluate(status).await;
        }
        Err(GatewayError::NotFound(ip)) => {
            error!(%ip, "no static IP mapping, discarding usage for this subscriber");
        }
        Err(GatewayError::TransactionLost { attempts }) => {
            error!(%ip, attempts, "data loss: unable to commit");
        }
        Err(e) => {
            error!(%ip, error = %e, "usage commit failed");
        }
    }

    buckets.reset();
    *interval_start = store::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake_store::{FakeAccount, FakeStore};
    use std::time::Duration as StdDuration;

    fn ip() -> IpAddr {
        "10.45.0.7".parse().unwrap()
    }

    async fn seeded_store(balance: i64) -> Arc<FakeStore> {
        let store = Arc::new(FakeStore::new());
        store
            .seed_subscriber(
                ip(),
                FakeAccount {
                    imsi: "001010000000001".to_string(),
                    raw_up: 0,
                    raw_down: 0,
                    data_balance: balance,
                    bridged: true,
                },
            )
            .await;
        store
    }

    #[tokio::test]
    async fn no_threshold_crossed_after_one_interval() {
        let fake = seeded_store(100_000_000).await;
        let store: Arc<dyn Store> = fake.clone();
        let (enforcement, mut eval_rx) = EnforcementHandle::new_for_test();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mailbox = spawn(
            ip(),
            100_000_000,
            store,
            enforcement,
            StdDuration::from_millis(30),
            shutdown_rx,
        );

        for _ in 0..10 {
            mailbox
                .send(UsageEvent {
                    ip: ip(),
                    kind: UsageKind::ExternUp,
                    bytes: 1500,
                })
                .await
                .unwrap();
        }

        let status = tokio::time::timeout(StdDuration::from_millis(200), eval_rx.recv())
            .await
            .expect("should have flushed on timer")
            .unwrap();

        assert_eq!(status.current_balance, 99_985_000);
        let acct = fake.account("001010000000001").await.unwrap();
        assert_eq!(acct.raw_up, 15_000);
        assert!(acct.bridged);
    }

    #[tokio::test]
    async fn exhaustion_flushes_immediately_without_waiting_for_timer() {
        let fake = seeded_store(20_000).await;
        let store: Arc<dyn Store> = fake.clone();
        let (enforcement, mut eval_rx) = EnforcementHandle::new_for_test();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mailbox = spawn(
            ip(),
            20_000,
            store,
            enforcement,
            StdDuration::from_secs(3600),
            shutdown_rx,
        );

        mailbox
            .send(UsageEvent {
                ip: ip(),
                kind: UsageKind::ExternUp,
                bytes: 15_000,
            })
            .await
            .unwrap();
        mailbox
            .send(UsageEvent {
                ip: ip(),
                kind: UsageKind::ExternUp,
                bytes: 10_000,
            })
            .await
            .unwrap();

        let status = tokio::time::timeout(StdDuration::from_millis(200), eval_rx.recv())
            .await
            .expect("should flush on exhaustion, not wait for the hour-long timer")
            .unwrap();
        assert_eq!(status.current_balance, 0);
        assert!(status.prior_balance > 0);
    }
}
