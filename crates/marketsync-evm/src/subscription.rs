//! Subscription Manager: one long-lived log subscription per event topic.
//!
//! Each [`TopicSubscription`] cycles through
//! `Disconnected → Subscribing → Streaming → (Error → Disconnected)`.
//! Logs are decoded and reconciled inline in receipt order, so a slow store
//! throttles the consumer. On any transport failure the worker waits a
//! fixed backoff and resubscribes, forever. Gaps left by reconnects are
//! filled by the catch-up job, not here.
//!
//! Shutdown is cooperative: the worker stops pulling new logs, lets the
//! in-flight reconciliation finish, and drops the stream (releasing the
//! subscription) before returning.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use marketsync_core::error::TransportError;
use marketsync_core::gateway::{ChainGateway, RawLog};
use marketsync_core::reconciler::{ReconcileOutcome, Reconciler};
use marketsync_core::types::{normalize_address, EventKind};

use crate::abi;
use crate::decoder::EventDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Streaming,
    Error,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Counters for one topic worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionMetrics {
    pub logs_received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub deferred: u64,
    pub anomalies: u64,
    pub removed_skipped: u64,
    pub decode_errors: u64,
    pub reconcile_errors: u64,
    pub sessions: u64,
    pub reconnects: u64,
}

enum SessionEnd {
    Shutdown,
    Failed(TransportError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TopicSubscription {
    kind: EventKind,
    contract_address: String,
    topic0: String,
    gateway: Arc<dyn ChainGateway>,
    decoder: EventDecoder,
    reconciler: Arc<Reconciler>,
    backoff: Duration,
    state: Mutex<SubscriptionState>,
    metrics: Mutex<SubscriptionMetrics>,
}

impl TopicSubscription {
    pub fn new(
        kind: EventKind,
        contract_address: &str,
        gateway: Arc<dyn ChainGateway>,
        reconciler: Arc<Reconciler>,
        backoff: Duration,
    ) -> Self {
        Self {
            kind,
            contract_address: normalize_address(contract_address),
            topic0: abi::schema(kind).topic0(),
            gateway,
            decoder: EventDecoder::new(),
            reconciler,
            backoff,
            state: Mutex::new(SubscriptionState::Disconnected),
            metrics: Mutex::new(SubscriptionMetrics::default()),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn state(&self) -> SubscriptionState {
        *lock(&self.state)
    }

    pub fn metrics(&self) -> SubscriptionMetrics {
        lock(&self.metrics).clone()
    }

    fn set_state(&self, next: SubscriptionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(topic = %self.kind, from = %*state, to = %next, "subscription state");
            *state = next;
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(topic = %self.kind, contract = %self.contract_address, "subscription worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(SubscriptionState::Subscribing);
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = self.gateway.subscribe_logs(&self.contract_address, &self.topic0) => res,
            };

            let failure = match subscribed {
                Ok(stream) => {
                    lock(&self.metrics).sessions += 1;
                    self.set_state(SubscriptionState::Streaming);
                    info!(topic = %self.kind, "streaming logs");
                    match self.stream_session(stream, &shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.set_state(SubscriptionState::Error);
            warn!(
                topic = %self.kind,
                error = %failure,
                backoff_ms = self.backoff.as_millis() as u64,
                "subscription lost, retrying after backoff"
            );
            self.set_state(SubscriptionState::Disconnected);
            lock(&self.metrics).reconnects += 1;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
        self.set_state(SubscriptionState::Disconnected);
        info!(topic = %self.kind, "subscription worker stopped");
    }

    async fn stream_session(
        &self,
        mut stream: marketsync_core::gateway::LogStream,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            // Only the wait for the next log is cancellable; a log already
            // received is always reconciled to completion.
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                item = stream.next() => item,
            };
            match next {
                Some(Ok(log)) => self.handle_log(&log).await,
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => {
                    return SessionEnd::Failed(TransportError::SubscriptionClosed(
                        "stream ended".into(),
                    ))
                }
            }
        }
    }

    async fn handle_log(&self, log: &RawLog) {
        lock(&self.metrics).logs_received += 1;

        if log.is_removed() {
            lock(&self.metrics).removed_skipped += 1;
            debug!(topic = %self.kind, tx = %log.tx_hash, "skipping removed log");
            return;
        }

        let event = match self.decoder.decode(log) {
            Ok(ev) => ev,
            Err(e) => {
                lock(&self.metrics).decode_errors += 1;
                warn!(topic = %self.kind, tx = %log.tx_hash, error = %e, "failed to decode log, skipping");
                return;
            }
        };

        match self.reconciler.apply(&event).await {
            Ok(outcome) => {
                let mut m = lock(&self.metrics);
                match outcome {
                    ReconcileOutcome::Applied => m.applied += 1,
                    ReconcileOutcome::Duplicate => m.duplicates += 1,
                    ReconcileOutcome::Deferred { .. } => m.deferred += 1,
                    ReconcileOutcome::Anomaly => m.anomalies += 1,
                }
                debug!(
                    topic = %self.kind,
                    event = %event.key(),
                    block = event.block_number,
                    ?outcome,
                    "event reconciled"
                );
            }
            Err(e) => {
                lock(&self.metrics).reconcile_errors += 1;
                error!(topic = %self.kind, event = %event.key(), error = %e, "reconciliation failed");
            }
        }
    }
}

/// Owns one [`TopicSubscription`] per watched event topic.
pub struct SubscriptionManager {
    topics: Vec<Arc<TopicSubscription>>,
}

impl SubscriptionManager {
    /// One subscription for each marketplace event.
    pub fn new(
        contract_address: &str,
        gateway: Arc<dyn ChainGateway>,
        reconciler: Arc<Reconciler>,
        backoff: Duration,
    ) -> Self {
        let topics = EventKind::ALL
            .iter()
            .map(|kind| {
                Arc::new(TopicSubscription::new(
                    *kind,
                    contract_address,
                    gateway.clone(),
                    reconciler.clone(),
                    backoff,
                ))
            })
            .collect();
        Self { topics }
    }

    pub fn topics(&self) -> &[Arc<TopicSubscription>] {
        &self.topics
    }

    pub fn topic(&self, kind: EventKind) -> Option<&Arc<TopicSubscription>> {
        self.topics.iter().find(|t| t.kind() == kind)
    }

    /// Spawn every topic worker into `tasks`.
    pub fn spawn(&self, tasks: &mut JoinSet<()>, shutdown: &CancellationToken) {
        for topic in &self.topics {
            let topic = topic.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { topic.run(shutdown).await });
        }
    }
}
