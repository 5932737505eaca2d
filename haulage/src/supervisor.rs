//! Supervisor (C8).
//!
//! Owns the two task-handle maps named in §5 as the system's only shared
//! mutable structures, and is the only place that constructs them — no
//! implicit singletons (§9). Insertion is get-or-create atomic via
//! `dashmap`'s entry API: a lookup miss spawns a task and installs its
//! mailbox before releasing the shard, so a racing lookup either finds
//! nothing and also tries to install (and loses, discarding its task) or
//! finds the winning mailbox.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::capture::PacketSource;
use crate::classify::{self, Classifier};
use crate::effector::PacketFilterEffector;
use crate::enforcement::{self, EnforcementHandle};
use crate::flow_aggregator::{self, FlowMailbox};
use crate::model::{FiveTuple, UsageEvent};
use crate::store::Store;
use crate::subscriber_aggregator::{self, SubscriberMailbox};

pub struct Supervisor {
    store: Arc<dyn Store>,
    effector: Arc<dyn PacketFilterEffector>,
    classifier: Arc<Classifier>,
    flow_log_interval: Duration,
    user_log_interval: Duration,
    reenable_poll_interval: Duration,
    flows: DashMap<FiveTuple, FlowMailbox>,
    subscribers: Arc<DashMap<IpAddr, SubscriberMailbox>>,
    enforcement: EnforcementHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        effector: Arc<dyn PacketFilterEffector>,
        classifier: Classifier,
        flow_log_interval: Duration,
        user_log_interval: Duration,
        reenable_poll_interval: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<crate::model::SubscriberStatus>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (status_tx, status_rx) = mpsc::channel(enforcement::MAILBOX_CAPACITY);

        let supervisor = Arc::new(Self {
            store,
            effector,
            classifier: Arc::new(classifier),
            flow_log_interval,
            user_log_interval,
            reenable_poll_interval,
            flows: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
            enforcement: EnforcementHandle::new(status_tx),
            shutdown_tx,
        });

        (supervisor, status_rx)
    }

    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start C5's two long-lived background tasks: the threshold
    /// evaluator draining `status_rx` (returned by [`Supervisor::new`])
    /// and the topup poller.
    pub fn start_enforcement(
        &self,
        status_rx: mpsc::Receiver<crate::model::SubscriberStatus>,
    ) {
        enforcement::spawn_evaluator(
            status_rx,
            self.store.clone(),
            self.effector.clone(),
            self.shutdown_tx.subscribe(),
        );
        enforcement::spawn_topup_poller(
            self.store.clone(),
            self.effector.clone(),
            self.reenable_poll_interval,
            self.shutdown_tx.subscribe(),
        );
    }

    pub async fn reconcile_startup_state(&self) -> Result<(), crate::error::GatewayError> {
        enforcement::reconcile_startup_state(self.store.as_ref(), self.effector.as_ref()).await
    }

    /// Drain the capture source, classifying and routing each packet until
    /// the source yields `None` (closed) or shutdown fires.
    pub async fn run_ingress_loop(
        self: Arc<Self>,
        mut source: Box<dyn PacketSource>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("ingress loop shutting down");
                    break;
                }
                packet = source.recv() => {
                    match packet {
                        Some(packet) => self.handle_packet(&packet).await,
                        None => {
                            warn!("capture source closed, ending ingress loop");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, packet: &classify::DecodedPacket) {
        let output = classify::classify(packet);

        if let Some(event) = output.flow_event {
            let canonical = event.five_tuple.canonical();
            let mailbox = self.flow_mailbox(canonical).await;
            if mailbox.send(event).await.is_err() {
                // The task reclaimed itself between lookup and send; a
                // fresh one will be spawned on the next packet for this
                // flow, so the event is simply dropped (no ordering
                // invariant spans a reclamation boundary).
                self.flows.remove(&canonical);
            }
        }

        if let Some((five_tuple, payload)) = output.dns_candidate {
            if let Some(record) = crate::dns_extract::extract(five_tuple, &payload, crate::store::now()) {
                if let Err(e) = self.store.log_dns_response(record).await {
                    error!(error = %e, "failed to record DNS response");
                }
            }
        }
    }

    /// Atomic get-or-create lookup on the canonical-tuple map.
    async fn flow_mailbox(&self, canonical: FiveTuple) -> FlowMailbox {
        if let Some(existing) = self.flows.get(&canonical) {
            return existing.clone();
        }

        let (usage_tx, usage_rx) = mpsc::channel::<UsageEvent>(flow_aggregator::MAILBOX_CAPACITY);
        let mailbox = flow_aggregator::spawn(
            canonical,
            self.classifier.clone(),
            self.store.clone(),
            usage_tx,
            self.flow_log_interval,
            self.shutdown_tx.subscribe(),
        );

        let winner = match self.flows.entry(canonical) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(mailbox.clone());
                mailbox
            }
        };

        self.spawn_usage_router(usage_rx);
        winner
    }

    /// Spawn the task that drains one flow aggregator's usage fan-out and
    /// routes each event to the right subscriber aggregator, creating one
    /// get-or-create style just like the flow map. Only the fields the
    /// router needs are cloned in — this task outlives the call that
    /// spawned it, so it cannot borrow `self`.
    fn spawn_usage_router(&self, mut usage_rx: mpsc::Receiver<UsageEvent>) {
        let subscribers = self.subscribers.clone();
        let store = self.store.clone();
        let enforcement = self.enforcement.clone();
        let user_log_interval = self.user_log_interval;
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = usage_rx.recv().await {
                let mailbox = subscriber_mailbox(
                    &subscribers,
                    &store,
                    &enforcement,
                    user_log_interval,
                    &shutdown_tx,
                    event.ip,
                )
                .await;
                if mailbox.send(event).await.is_err() {
                    // The subscriber task reclaimed itself between lookup
                    // and send; a fresh one is spawned on the next event
                    // for this IP, so this one is simply dropped (same
                    // no-cross-reclamation-boundary rule as the flow map).
                    subscribers.remove(&event.ip);
                }
            }
        });
    }
}

/// Atomic get-or-create lookup on the subscriber-IP map. Reads the
/// subscriber's current `data_balance` from the gateway only when a task
/// doesn't already exist, per §4.3 ("the value read on task startup").
async fn subscriber_mailbox(
    subscribers: &Arc<DashMap<IpAddr, SubscriberMailbox>>,
    store: &Arc<dyn Store>,
    enforcement: &EnforcementHandle,
    user_log_interval: Duration,
    shutdown_tx: &broadcast::Sender<()>,
    ip: IpAddr,
) -> SubscriberMailbox {
    if let Some(existing) = subscribers.get(&ip) {
        return existing.clone();
    }

    let initial_balance = match store.subscriber_balance(ip).await {
        Ok(balance) => balance,
        Err(e) => {
            error!(%ip, error = %e, "failed to read starting balance, assuming zero");
            0
        }
    };

    let mailbox = subscriber_aggregator::spawn(
        ip,
        initial_balance,
        store.clone(),
        enforcement.clone(),
        user_log_interval,
        shutdown_tx.subscribe(),
    );

    match subscribers.entry(ip) {
        dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(mailbox.clone());
            mailbox
        }
    }
}
