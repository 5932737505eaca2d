//! Enforcement controller (C5).
//!
//! C3 hands this a post-commit [`SubscriberStatus`] over a mailbox rather
//! than calling it directly — the cycle this would otherwise create (C3 →
//! C5 → C4 → C3) is broken by making C5 a leaf: it calls the effector and
//! the gateway, never back into the subscriber aggregator (§9).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::effector::PacketFilterEffector;
use crate::model::SubscriberStatus;
use crate::store::Store;

const BYTES_10MB: i64 = 10 * 1024 * 1024;
const BYTES_5MB: i64 = 5 * 1024 * 1024;
const BYTES_1MB: i64 = 1024 * 1024;

pub const MAILBOX_CAPACITY: usize = 256;

/// Handle the subscriber aggregator holds to hand off a commit status for
/// threshold evaluation. Cloneable; cheap.
#[derive(Clone)]
pub struct EnforcementHandle(mpsc::Sender<SubscriberStatus>);

impl EnforcementHandle {
    /// Wrap the sending half of the evaluator's mailbox. The receiving
    /// half is handed to [`spawn_evaluator`] by the supervisor, which owns
    /// both ends' lifetimes.
    pub fn new(tx: mpsc::Sender<SubscriberStatus>) -> Self {
        Self(tx)
    }

    pub async fn evaluate(&self, status: SubscriberStatus) {
        if self.0.send(status).await.is_err() {
            error!(ip = %status.addr, "enforcement controller mailbox closed, status dropped");
        }
    }

    /// Test-only constructor returning the raw receiving end instead of
    /// spawning the evaluator loop, so tests can assert on what the
    /// subscriber aggregator would have sent without the rest of C5.
    #[cfg(test)]
    pub fn new_for_test() -> (Self, mpsc::Receiver<SubscriberStatus>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        (Self(tx), rx)
    }
}

/// Startup reconciliation: make the kernel filter table match the
/// persisted `bridged` column for every subscriber. Required because the
/// filter table outlives process restarts.
pub async fn reconcile_startup_state(
    store: &dyn Store,
    effector: &dyn PacketFilterEffector,
) -> Result<(), crate::error::GatewayError> {
    let rows = store.query_global_bridged_state().await?;
    for (ip, bridged) in rows {
        let result = if bridged {
            effector.disable_block(ip).await
        } else {
            effector.enable_block(ip).await
        };
        if let Err(e) = result {
            error!(%ip, error = %e, "startup reconciliation failed for subscriber");
        }
    }
    Ok(())
}

/// Spawn the loop that receives commit statuses from every subscriber
/// aggregator and evaluates the threshold table against each one.
pub fn spawn_evaluator(
    mut status_rx: mpsc::Receiver<SubscriberStatus>,
    store: Arc<dyn Store>,
    effector: Arc<dyn PacketFilterEffector>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                status = status_rx.recv() => {
                    match status {
                        Some(status) => evaluate(status, &store, &effector).await,
                        None => break,
                    }
                }
            }
        }
    });
}

/// Fire exactly one side effect per commit, testing rules from lowest to
/// highest threshold so that crossing several at once produces only the
/// most-critical message (§4.5).
async fn evaluate(status: SubscriberStatus, store: &Arc<dyn Store>, effector: &Arc<dyn PacketFilterEffector>) {
    let SubscriberStatus {
        addr,
        current_balance: current,
        prior_balance: prior,
        ..
    } = status;

    if current <= 0 && prior > 0 {
        if let Err(e) = effector.enable_block(addr).await {
            error!(ip = %addr, error = %e, "enable_block failed, bridged state left unchanged");
            return;
        }
        if let Err(e) = store.update_bridged_state(addr, false).await {
            error!(ip = %addr, error = %e, "failed to persist bridged=false after enable_block");
        }
        info!(ip = %addr, "no balance, forwarding blocked");
        return;
    }

    if current <= BYTES_1MB && prior > BYTES_1MB {
        info!(ip = %addr, current, "subscriber balance below 1 MB");
        return;
    }
    if current <= BYTES_5MB && prior > BYTES_5MB {
        info!(ip = %addr, current, "subscriber balance below 5 MB");
        return;
    }
    if current <= BYTES_10MB && prior > BYTES_10MB {
        info!(ip = %addr, current, "subscriber balance below 10 MB");
        return;
    }
    // current > 10 MB: fast path, no log.
}

/// Long-lived task that polls for topped-up subscribers and restores
/// forwarding for each. Terminates on the supervisor's shutdown signal.
pub fn spawn_topup_poller(
    store: Arc<dyn Store>,
    effector: Arc<dyn PacketFilterEffector>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    match store.query_topped_up_customers().await {
                        Ok(ips) => {
                            for ip in ips {
                                restore_forwarding(ip, &store, &effector).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "topup poll failed"),
                    }
                }
            }
        }
    });
}

async fn restore_forwarding(ip: IpAddr, store: &Arc<dyn Store>, effector: &Arc<dyn PacketFilterEffector>) {
    if let Err(e) = effector.disable_block(ip).await {
        error!(%ip, error = %e, "disable_block failed during topup restore");
        return;
    }
    if let Err(e) = store.update_bridged_state(ip, true).await {
        error!(%ip, error = %e, "failed to persist bridged=true after topup restore");
    }
}
