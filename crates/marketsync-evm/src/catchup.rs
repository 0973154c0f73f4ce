//! Catch-up reconciliation: fills gaps the live subscriptions missed.
//!
//! Each run reads `SyncState.last_synced_block`, queries historical logs for
//! `[last_synced_block + 1, head - confirmation_depth]` in bounded
//! `eth_getLogs` batches, and feeds them through the same decoder and
//! reconciler as the live path. The checkpoint advances only after a whole
//! batch has been reconciled, so a failure mid-batch replays it next run.
//! It also stays below the oldest event still waiting in the reconciler's
//! retry queue, so a restart re-reads that event's block. Replays are
//! harmless because every write is idempotent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use marketsync_core::config::SyncConfig;
use marketsync_core::error::SyncError;
use marketsync_core::gateway::ChainGateway;
use marketsync_core::reconciler::{ReconcileOutcome, Reconciler};
use marketsync_core::store::SyncStateStore;
use marketsync_core::sync_state::SyncStateManager;
use marketsync_core::types::{normalize_address, SyncStatus};

use crate::abi;
use crate::decoder::EventDecoder;

const MIN_RUN_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Totals for one catch-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub from_block: u64,
    pub to_block: u64,
    pub batches: u32,
    pub logs: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub deferred: u64,
    pub anomalies: u64,
    pub decode_errors: u64,
    /// Checkpoint after the run; below `to_block` while events are queued.
    pub checkpoint: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpRun {
    /// The operator paused this contract.
    Paused,
    /// Nothing confirmed beyond the checkpoint yet.
    UpToDate { last_synced_block: u64 },
    Synced(CatchUpReport),
}

pub struct CatchUpJob {
    contract_address: String,
    gateway: Arc<dyn ChainGateway>,
    decoder: EventDecoder,
    reconciler: Arc<Reconciler>,
    sync_state: SyncStateManager,
    topics: Vec<String>,
    start_block: u64,
    confirmation_depth: u64,
    batch_size: u64,
}

impl CatchUpJob {
    pub fn new(
        config: &SyncConfig,
        gateway: Arc<dyn ChainGateway>,
        reconciler: Arc<Reconciler>,
        sync_store: Arc<dyn SyncStateStore>,
    ) -> Self {
        Self {
            contract_address: normalize_address(&config.marketplace_address),
            gateway,
            decoder: EventDecoder::new(),
            reconciler,
            sync_state: SyncStateManager::new(sync_store, &config.marketplace_address),
            topics: abi::all_topics(),
            start_block: config.start_block,
            confirmation_depth: config.confirmation_depth,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn sync_state(&self) -> &SyncStateManager {
        &self.sync_state
    }

    /// Reconcile every confirmed block past the checkpoint.
    pub async fn run_once(&self) -> Result<CatchUpRun, SyncError> {
        let state = self.sync_state.load_or_init(self.start_block).await?;
        if state.status == SyncStatus::Paused {
            debug!(contract = %self.contract_address, "catch-up skipped, contract paused");
            return Ok(CatchUpRun::Paused);
        }

        // Settle due retries first so the held checkpoint can move.
        if let Err(e) = self.reconciler.retry_pending().await {
            return Err(self.fail(e).await);
        }

        let head = match self.gateway.block_number().await {
            Ok(h) => h,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        let target = head.saturating_sub(self.confirmation_depth);
        if target <= state.last_synced_block {
            return Ok(CatchUpRun::UpToDate {
                last_synced_block: state.last_synced_block,
            });
        }

        let mut report = CatchUpReport {
            from_block: state.last_synced_block + 1,
            to_block: target,
            ..Default::default()
        };
        info!(
            contract = %self.contract_address,
            from = report.from_block,
            to = target,
            head,
            "catch-up started"
        );

        let mut from = report.from_block;
        while from <= target {
            let to = from.saturating_add(self.batch_size - 1).min(target);
            if let Err(e) = self.reconcile_range(from, to, &mut report).await {
                return Err(self.fail(e).await);
            }
            let checkpoint = self.checkpoint_for(to);
            report.checkpoint = self.sync_state.advance(checkpoint).await?.last_synced_block;
            report.batches += 1;
            debug!(from, to, checkpoint, "catch-up batch reconciled");
            from = to + 1;
        }

        info!(
            contract = %self.contract_address,
            to = target,
            logs = report.logs,
            applied = report.applied,
            deferred = report.deferred,
            checkpoint = report.checkpoint,
            "catch-up complete"
        );
        Ok(CatchUpRun::Synced(report))
    }

    /// `to`, unless a queued event sits at or below it.
    fn checkpoint_for(&self, to: u64) -> u64 {
        match self.reconciler.lowest_pending_block() {
            Some(pending) if pending <= to => {
                let held = pending.saturating_sub(1);
                debug!(to, held, pending, "checkpoint held below queued event");
                held
            }
            _ => to,
        }
    }

    async fn reconcile_range(
        &self,
        from: u64,
        to: u64,
        report: &mut CatchUpReport,
    ) -> Result<(), SyncError> {
        let mut logs = self
            .gateway
            .get_logs(&self.contract_address, &self.topics, from, to)
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.drain(..) {
            report.logs += 1;
            if log.is_removed() {
                continue;
            }
            match self.decoder.decode(&log) {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    report.decode_errors += 1;
                    warn!(tx = %log.tx_hash, error = %e, "failed to decode historical log, skipping");
                }
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        for event in &events {
            match self.reconciler.apply(event).await? {
                ReconcileOutcome::Applied => report.applied += 1,
                ReconcileOutcome::Duplicate => report.duplicates += 1,
                ReconcileOutcome::Deferred { .. } => report.deferred += 1,
                ReconcileOutcome::Anomaly => report.anomalies += 1,
            }
        }
        Ok(())
    }

    /// Record the failure on the sync state and hand the error back.
    async fn fail(&self, err: SyncError) -> SyncError {
        if let Err(e) = self.sync_state.mark_error(&err.to_string()).await {
            error!(error = %e, "failed to record sync error");
        }
        err
    }

    /// Run on a fixed interval until `shutdown` is cancelled.
    pub async fn run(&self, interval: std::time::Duration, shutdown: CancellationToken) {
        info!(contract = %self.contract_address, interval_ms = interval.as_millis() as u64, "catch-up job started");
        let mut ticker = tokio::time::interval(interval.max(MIN_RUN_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(contract = %self.contract_address, error = %e, "catch-up run failed");
                    }
                }
            }
        }
        info!(contract = %self.contract_address, "catch-up job stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gateway::{LogFactory, MockGateway};
    use alloy_primitives::U256;
    use marketsync_core::memory::MemoryStore;
    use marketsync_core::store::ProjectionStore;
    use marketsync_core::types::{Amount, ListingRecord, ListingStatus};
    use std::time::Duration;

    const MARKET: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const NFT: &str = "0x00000000000000000000000000000000000000aa";
    const SELLER: &str = "0x00000000000000000000000000000000000000a1";
    const BUYER: &str = "0x00000000000000000000000000000000000000bb";

    fn job(gw: Arc<MockGateway>, store: Arc<MemoryStore>, batch: u64) -> CatchUpJob {
        let mut cfg = SyncConfig::new(MARKET);
        cfg.start_block = 100;
        cfg.confirmation_depth = 2;
        cfg.batch_size = batch;
        let rec = Arc::new(Reconciler::new(store.clone(), 3, Duration::ZERO));
        CatchUpJob::new(&cfg, gw, rec, store)
    }

    #[tokio::test]
    async fn reconciles_in_batches_and_advances() {
        let gw = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        let f = LogFactory::new(MARKET);
        // Out of order within the range: the sale is returned first.
        gw.add_history([
            f.sold(7, BUYER, 100, 115, "0xs7", 0),
            f.created(7, NFT, 1, SELLER, 100, 105, "0xc7", 0),
            f.created(8, NFT, 2, SELLER, 50, 121, "0xc8", 0),
        ]);
        gw.set_head(122);

        let job = job(gw.clone(), store.clone(), 10);
        let CatchUpRun::Synced(report) = job.run_once().await.unwrap() else {
            panic!("expected a sync");
        };
        assert_eq!(report.from_block, 100);
        assert_eq!(report.to_block, 120);
        assert_eq!(report.batches, 3);
        assert_eq!(report.applied, 2);
        assert_eq!(gw.get_logs_ranges(), vec![(100, 109), (110, 119), (120, 120)]);

        let sold = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(sold.status, ListingStatus::Sold);
        // Block 121 is not yet confirmed.
        assert!(store.listing(U256::from(8)).await.unwrap().is_none());

        let state = job.sync_state().load().await.unwrap().unwrap();
        assert_eq!(state.last_synced_block, 120);
        assert_eq!(job.run_once().await.unwrap(), CatchUpRun::UpToDate { last_synced_block: 120 });
    }

    #[tokio::test]
    async fn failed_batch_does_not_advance() {
        let gw = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        gw.set_head(200);
        gw.fail_get_logs(1);

        let job = job(gw.clone(), store.clone(), 1000);
        assert!(job.run_once().await.unwrap_err().is_transport());
        let state = job.sync_state().load().await.unwrap().unwrap();
        assert_eq!(state.last_synced_block, 99);
        assert_eq!(state.status, SyncStatus::Error);

        assert!(matches!(job.run_once().await.unwrap(), CatchUpRun::Synced(_)));
        let state = job.sync_state().load().await.unwrap().unwrap();
        assert_eq!(state.last_synced_block, 198);
        assert_eq!(state.status, SyncStatus::Active);
    }

    #[tokio::test]
    async fn replayed_range_creates_no_duplicates() {
        let gw = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        let f = LogFactory::new(MARKET);
        gw.add_history([
            f.created(7, NFT, 1, SELLER, 100, 105, "0xc7", 0),
            f.sold(7, BUYER, 100, 106, "0xs7", 1),
        ]);
        gw.set_head(110);

        let job = job(gw, store.clone(), 1000);
        job.run_once().await.unwrap();
        assert_eq!(store.transaction_count(), 2);

        job.sync_state().rewind(100).await.unwrap();
        let CatchUpRun::Synced(report) = job.run_once().await.unwrap() else {
            panic!("expected a sync");
        };
        assert_eq!(report.duplicates, 2);
        assert_eq!(store.transaction_count(), 2);
        assert_eq!(store.listing_count(), 1);
    }

    #[tokio::test]
    async fn checkpoint_waits_for_queued_events_across_restarts() {
        let gw = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        let f = LogFactory::new(MARKET);
        gw.add_history([f.sold(7, BUYER, 100, 105, "0xs7", 0)]);
        gw.set_head(112);

        let first = job(gw.clone(), store.clone(), 1000);
        let CatchUpRun::Synced(report) = first.run_once().await.unwrap() else {
            panic!("expected a sync");
        };
        assert_eq!(report.deferred, 1);
        assert_eq!(report.checkpoint, 104);
        drop(first);

        // The listing shows up while the process is down.
        let listing = ListingRecord::new_active(
            U256::from(7),
            NFT,
            U256::from(1),
            SELLER,
            Amount::from_u64(100),
            chrono::Utc::now(),
            None,
        );
        store.insert_listing_if_absent(&listing).await.unwrap();

        let restarted = job(gw.clone(), store.clone(), 1000);
        assert_eq!(restarted.reconciler.restore_pending().await.unwrap(), 1);
        let CatchUpRun::Synced(report) = restarted.run_once().await.unwrap() else {
            panic!("expected a sync");
        };
        assert_eq!(report.from_block, 105);
        assert_eq!(report.checkpoint, 110);

        let sold = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(sold.status, ListingStatus::Sold);
        assert!(store.deferred_events().await.unwrap().is_empty());
        assert!(store.anomalies(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_without_restore_still_applies_the_held_block() {
        let gw = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        let f = LogFactory::new(MARKET);
        gw.add_history([f.sold(7, BUYER, 100, 105, "0xs7", 0)]);
        gw.set_head(112);

        job(gw.clone(), store.clone(), 1000).run_once().await.unwrap();
        let listing = ListingRecord::new_active(
            U256::from(7),
            NFT,
            U256::from(1),
            SELLER,
            Amount::from_u64(100),
            chrono::Utc::now(),
            None,
        );
        store.insert_listing_if_absent(&listing).await.unwrap();

        // A fresh queue: the sale is only found again because block 105 is re-read.
        job(gw, store.clone(), 1000).run_once().await.unwrap();
        let sold = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(sold.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn paused_contract_is_skipped() {
        let gw = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        gw.set_head(500);
        let job = job(gw.clone(), store, 1000);
        job.sync_state().load_or_init(100).await.unwrap();
        job.sync_state().pause().await.unwrap();
        assert_eq!(job.run_once().await.unwrap(), CatchUpRun::Paused);
        assert!(gw.get_logs_ranges().is_empty());
    }
}
