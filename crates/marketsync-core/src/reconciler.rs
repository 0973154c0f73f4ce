//! State Reconciler: applies decoded events to the projection.
//!
//! Every write is an idempotent upsert on the record's natural key
//! (`item_id` for listings, `(tx_hash, log_index)` for transactions), so
//! redelivered events are no-ops. Status changes go through the store's
//! conditional updates, which keeps concurrent topic workers from losing
//! updates on the same item.
//!
//! A sale (or cancellation) that arrives before its listing is parked in a
//! bounded retry queue. It is retried as soon as the listing appears, and
//! periodically via [`Reconciler::retry_pending`]. Once the attempts are
//! exhausted it is recorded as an [`Anomaly`] for operator inspection.
//!
//! The verified write path calls [`Reconciler::upsert_listing`],
//! [`Reconciler::apply_sale`] and [`Reconciler::apply_cancel`], the same
//! entry points the event path uses.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::stats::StatsAggregator;
use crate::store::{ProjectionStore, TransitionOutcome};
use crate::types::{
    normalize_address, Amount, Anomaly, ChainEvent, DeferredEvent, ListingRecord, ListingStatus,
    MarketEvent, SaleUpdate, TransactionRecord, TxKey, TxStatus, TxType,
};

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The projection changed.
    Applied,
    /// The event was already reflected; nothing changed.
    Duplicate,
    /// The event could not be resolved yet and is queued for retry.
    Deferred { attempts: u32 },
    /// Retries are exhausted; the event was recorded as an anomaly.
    Anomaly,
}

#[derive(Debug, Clone)]
struct PendingEvent {
    event: ChainEvent,
    attempts: u32,
    reason: String,
    first_seen: DateTime<Utc>,
    next_attempt: Instant,
    /// Taken by a retry pass; stays queued until that pass settles it.
    in_flight: bool,
}

impl PendingEvent {
    fn to_deferred(&self) -> DeferredEvent {
        DeferredEvent {
            event: self.event.clone(),
            attempts: self.attempts,
            reason: self.reason.clone(),
            first_seen: self.first_seen,
        }
    }
}

/// Result of one application attempt.
enum Attempt {
    Done(ReconcileOutcome),
    Unresolved(String),
}

pub struct Reconciler {
    store: Arc<dyn ProjectionStore>,
    stats: StatsAggregator,
    /// Retry queue, one entry per event key. Mirrored to the store so a
    /// restart resumes it.
    pending: Mutex<BTreeMap<TxKey, PendingEvent>>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ProjectionStore>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            stats: StatsAggregator::new(store.clone()),
            store,
            pending: Mutex::new(BTreeMap::new()),
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectionStore> {
        &self.store
    }

    /// Number of events waiting in the retry queue.
    pub fn pending_len(&self) -> usize {
        self.queue().len()
    }

    /// Lowest block holding an event that is still queued. Catch-up must
    /// not checkpoint past it.
    pub fn lowest_pending_block(&self) -> Option<u64> {
        self.queue().values().map(|p| p.event.block_number).min()
    }

    fn queue(&self) -> MutexGuard<'_, BTreeMap<TxKey, PendingEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload events parked by a previous run. They are due immediately.
    /// Keys already queued are left alone.
    pub async fn restore_pending(&self) -> Result<usize, SyncError> {
        let parked = self.store.deferred_events().await?;
        let now = Instant::now();
        let mut restored = 0;
        let mut queue = self.queue();
        for deferred in parked {
            if let Entry::Vacant(slot) = queue.entry(deferred.key()) {
                slot.insert(PendingEvent {
                    event: deferred.event,
                    attempts: deferred.attempts,
                    reason: deferred.reason,
                    first_seen: deferred.first_seen,
                    next_attempt: now,
                    in_flight: false,
                });
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "retry queue restored from store");
        }
        Ok(restored)
    }

    // ─── Event path ─────────────────────────────────────────────────────────

    /// Apply one decoded event.
    ///
    /// Only storage failures are returned as errors; unresolvable events
    /// are deferred or recorded as anomalies instead.
    pub async fn apply(&self, event: &ChainEvent) -> Result<ReconcileOutcome, SyncError> {
        let key = event.key();
        if self.queue().contains_key(&key) {
            debug!(event = %key, "event already queued for retry");
            return Ok(ReconcileOutcome::Deferred { attempts: 0 });
        }

        let outcome = match self.try_apply(event).await? {
            Attempt::Done(outcome) => outcome,
            Attempt::Unresolved(reason) => {
                self.park(
                    PendingEvent {
                        event: event.clone(),
                        attempts: 0,
                        reason: String::new(),
                        first_seen: Utc::now(),
                        next_attempt: Instant::now(),
                        in_flight: false,
                    },
                    reason,
                )
                .await?
            }
        };

        if let (ReconcileOutcome::Applied, Ok(MarketEvent::Created { item_id, .. })) =
            (outcome, event.market_event())
        {
            self.retry_item(item_id).await?;
        }
        Ok(outcome)
    }

    /// Retry every queued event whose delay has elapsed, in chain order.
    /// Returns how many were resolved (applied or found to be duplicates).
    pub async fn retry_pending(&self) -> Result<usize, SyncError> {
        let now = Instant::now();
        let due = self.take_pending(|p| p.next_attempt <= now);
        self.retry(due).await
    }

    /// Retry queued events for `item_id` immediately, regardless of delay.
    async fn retry_item(&self, item_id: U256) -> Result<usize, SyncError> {
        let due = self.take_pending(|p| p.event.item_id() == Some(item_id));
        self.retry(due).await
    }

    /// Mark matching entries in flight and hand out copies, oldest block
    /// first. The entries stay queued until settled.
    fn take_pending(&self, pick: impl Fn(&PendingEvent) -> bool) -> Vec<PendingEvent> {
        let mut queue = self.queue();
        let mut taken: Vec<PendingEvent> = queue
            .values_mut()
            .filter(|p| !p.in_flight && pick(p))
            .map(|p| {
                p.in_flight = true;
                p.clone()
            })
            .collect();
        taken.sort_by_key(|p| (p.event.block_number, p.event.log_index));
        taken
    }

    async fn retry(&self, due: Vec<PendingEvent>) -> Result<usize, SyncError> {
        let mut resolved = 0;
        let mut iter = due.into_iter();
        while let Some(pending) = iter.next() {
            let key = pending.event.key();
            match self.try_apply(&pending.event).await {
                Ok(Attempt::Done(_)) => {
                    resolved += 1;
                    self.queue().remove(&key);
                    self.forget_deferred(&key).await;
                    info!(
                        event = %key,
                        attempts = pending.attempts + 1,
                        "deferred event resolved"
                    );
                }
                Ok(Attempt::Unresolved(reason)) => {
                    self.park(pending, reason).await?;
                }
                Err(e) => {
                    // Release this and the untried remainder unchanged.
                    let mut queue = self.queue();
                    for p in std::iter::once(pending).chain(iter) {
                        if let Some(entry) = queue.get_mut(&p.event.key()) {
                            entry.in_flight = false;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(resolved)
    }

    /// Count a failed attempt and either requeue the event or record it as
    /// an anomaly.
    async fn park(
        &self,
        mut pending: PendingEvent,
        reason: String,
    ) -> Result<ReconcileOutcome, SyncError> {
        pending.attempts += 1;
        pending.reason = reason;
        pending.in_flight = false;
        let key = pending.event.key();
        if pending.attempts >= self.max_attempts {
            let anomaly = Anomaly {
                event_key: key.to_string(),
                kind: pending.event.kind,
                item_id: pending.event.item_id(),
                reason: pending.reason.clone(),
                attempts: pending.attempts,
                event: pending.event.clone(),
                first_seen: pending.first_seen,
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.store.record_anomaly(&anomaly).await {
                self.enqueue(pending);
                return Err(e);
            }
            self.queue().remove(&key);
            self.forget_deferred(&key).await;
            error!(
                event = %key,
                kind = %anomaly.kind,
                attempts = anomaly.attempts,
                reason = %anomaly.reason,
                "event unresolved after retries, recorded as anomaly"
            );
            return Ok(ReconcileOutcome::Anomaly);
        }

        pending.next_attempt = Instant::now() + self.retry_delay;
        let queued = self.enqueue(pending);
        warn!(event = %key, attempts = queued.attempts, reason = %queued.reason, "event deferred");
        self.store.save_deferred(&queued.to_deferred()).await?;
        Ok(ReconcileOutcome::Deferred {
            attempts: queued.attempts,
        })
    }

    /// Insert or merge by key, so one event never occupies two slots.
    fn enqueue(&self, pending: PendingEvent) -> PendingEvent {
        match self.queue().entry(pending.event.key()) {
            Entry::Vacant(slot) => slot.insert(pending).clone(),
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.attempts = entry.attempts.max(pending.attempts);
                entry.first_seen = entry.first_seen.min(pending.first_seen);
                entry.reason = pending.reason;
                entry.next_attempt = pending.next_attempt;
                entry.in_flight = false;
                entry.clone()
            }
        }
    }

    /// The queue entry is already gone; a stale persisted copy resolves as a
    /// duplicate after the next restore.
    async fn forget_deferred(&self, key: &TxKey) {
        if let Err(e) = self.store.remove_deferred(key).await {
            warn!(event = %key, error = %e, "failed to drop persisted deferred event");
        }
    }

    async fn try_apply(&self, event: &ChainEvent) -> Result<Attempt, SyncError> {
        let at = event.block_time().unwrap_or_else(Utc::now);
        match event.market_event()? {
            MarketEvent::Created {
                item_id,
                nft_contract,
                token_id,
                seller,
                price,
            } => {
                let listing = ListingRecord::new_active(
                    item_id,
                    &nft_contract,
                    token_id,
                    &seller,
                    price,
                    at,
                    Some(event.tx_hash.to_ascii_lowercase()),
                );
                let tx = chain_tx(event, TxType::List, &listing, Some(&listing.seller), None, price);
                let inserted = self.upsert_listing(&listing, Some(&tx)).await?;
                Ok(Attempt::Done(if inserted {
                    ReconcileOutcome::Applied
                } else {
                    ReconcileOutcome::Duplicate
                }))
            }

            MarketEvent::Sold { item_id, buyer, price } => {
                let Some(listing) = self.store.listing(item_id).await? else {
                    return Ok(Attempt::Unresolved(format!("sale for unknown item {item_id}")));
                };
                let sale = sale_from_event(event, &listing, &buyer, price);
                match self.apply_sale(&sale).await? {
                    TransitionOutcome::Applied(_) => Ok(Attempt::Done(ReconcileOutcome::Applied)),
                    TransitionOutcome::Terminal(current)
                        if current.status == ListingStatus::Sold
                            && current.sale_tx_hash.as_deref() == Some(sale.tx.key.tx_hash.as_str()) =>
                    {
                        Ok(Attempt::Done(ReconcileOutcome::Duplicate))
                    }
                    TransitionOutcome::Terminal(current) => Ok(Attempt::Unresolved(format!(
                        "sale for item {item_id} which is already {}",
                        current.status
                    ))),
                    TransitionOutcome::Missing => {
                        Ok(Attempt::Unresolved(format!("sale for unknown item {item_id}")))
                    }
                }
            }

            MarketEvent::Canceled { item_id } => {
                let Some(listing) = self.store.listing(item_id).await? else {
                    return Ok(Attempt::Unresolved(format!(
                        "cancellation for unknown item {item_id}"
                    )));
                };
                let tx = chain_tx(event, TxType::Cancel, &listing, Some(&listing.seller), None, Amount::ZERO);
                match self.apply_cancel(item_id, at, Some(&tx)).await? {
                    TransitionOutcome::Applied(_) => Ok(Attempt::Done(ReconcileOutcome::Applied)),
                    TransitionOutcome::Terminal(_) => Ok(Attempt::Done(ReconcileOutcome::Duplicate)),
                    TransitionOutcome::Missing => Ok(Attempt::Unresolved(format!(
                        "cancellation for unknown item {item_id}"
                    ))),
                }
            }
        }
    }

    // ─── Shared write entry points ──────────────────────────────────────────

    /// Insert a listing if its `item_id` is new, plus an optional history
    /// entry. Returns `true` if the listing was written.
    pub async fn upsert_listing(
        &self,
        listing: &ListingRecord,
        tx: Option<&TransactionRecord>,
    ) -> Result<bool, SyncError> {
        let inserted = self.store.insert_listing_if_absent(listing).await?;
        let tx_inserted = match tx {
            Some(tx) => self.store.insert_transaction_if_absent(tx).await?,
            None => false,
        };
        if inserted {
            debug!(item_id = %listing.item_id, seller = %listing.seller, price = %listing.price, "listing created");
        }
        if inserted || tx_inserted {
            self.refresh_stats(&listing.nft_contract).await;
        }
        Ok(inserted)
    }

    /// Move an active listing to `sold` and append its sale record.
    pub async fn apply_sale(&self, sale: &SaleUpdate) -> Result<TransitionOutcome, SyncError> {
        let outcome = self.store.record_sale(sale).await?;
        if let TransitionOutcome::Applied(listing) = &outcome {
            debug!(item_id = %sale.item_id, buyer = %sale.buyer, value = %sale.tx.value, "listing sold");
            self.refresh_stats(&listing.nft_contract).await;
        }
        Ok(outcome)
    }

    /// Move an active listing to `cancelled`.
    pub async fn apply_cancel(
        &self,
        item_id: U256,
        at: DateTime<Utc>,
        tx: Option<&TransactionRecord>,
    ) -> Result<TransitionOutcome, SyncError> {
        let outcome = self.store.cancel_listing(item_id, at, tx).await?;
        if let TransitionOutcome::Applied(listing) = &outcome {
            debug!(item_id = %item_id, "listing cancelled");
            self.refresh_stats(&listing.nft_contract).await;
        }
        Ok(outcome)
    }

    /// Stats are derived data; a failed refresh is logged and picked up by
    /// the next successful reconciliation for the contract.
    async fn refresh_stats(&self, nft_contract: &str) {
        if let Err(e) = self.stats.recompute(nft_contract).await {
            warn!(nft_contract, error = %e, "stats recompute failed");
        }
    }
}

/// The sale update a `MarketItemSold` log implies for `listing`. Keyed on
/// the log itself, so the same sale reaching the store by any path lands on
/// one record.
pub fn sale_from_event(
    event: &ChainEvent,
    listing: &ListingRecord,
    buyer: &str,
    price: Amount,
) -> SaleUpdate {
    let buyer = normalize_address(buyer);
    SaleUpdate {
        item_id: listing.item_id,
        tx: chain_tx(event, TxType::Sale, listing, Some(&listing.seller), Some(&buyer), price),
        buyer,
        sold_at: event.block_time().unwrap_or_else(Utc::now),
    }
}

/// History entry for a chain-sourced event.
fn chain_tx(
    event: &ChainEvent,
    tx_type: TxType,
    listing: &ListingRecord,
    from: Option<&str>,
    to: Option<&str>,
    value: Amount,
) -> TransactionRecord {
    TransactionRecord {
        key: TxKey::chain(&event.tx_hash, event.log_index),
        tx_type,
        item_id: Some(listing.item_id),
        nft_contract: Some(listing.nft_contract.clone()),
        token_id: Some(listing.token_id),
        from_address: from.map(normalize_address),
        to_address: to.map(normalize_address),
        value,
        platform_fee: Amount::ZERO,
        block_number: Some(event.block_number),
        block_timestamp: event.block_time(),
        status: TxStatus::Confirmed,
        recorded_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::{EventKind, FieldValue};
    use std::collections::BTreeMap;

    const MARKET: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const NFT: &str = "0x00000000000000000000000000000000000000aa";
    const SELLER: &str = "0x00000000000000000000000000000000000000a1";
    const BUYER: &str = "0x00000000000000000000000000000000000000bb";

    fn event(kind: EventKind, tx: &str, log_index: u32, fields: Vec<(&str, FieldValue)>) -> ChainEvent {
        ChainEvent {
            kind,
            contract_address: MARKET.into(),
            block_number: 100,
            log_index,
            tx_hash: tx.into(),
            block_timestamp: Some(1_700_000_000),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn created(item: u64, price: u64, tx: &str) -> ChainEvent {
        event(
            EventKind::MarketItemCreated,
            tx,
            0,
            vec![
                ("itemId", FieldValue::Uint(U256::from(item))),
                ("nftContract", FieldValue::Address(NFT.into())),
                ("tokenId", FieldValue::Uint(U256::from(item * 10))),
                ("seller", FieldValue::Address(SELLER.into())),
                ("price", FieldValue::Uint(U256::from(price))),
            ],
        )
    }

    fn sold(item: u64, price: u64, tx: &str) -> ChainEvent {
        event(
            EventKind::MarketItemSold,
            tx,
            1,
            vec![
                ("itemId", FieldValue::Uint(U256::from(item))),
                ("buyer", FieldValue::Address(BUYER.into())),
                ("price", FieldValue::Uint(U256::from(price))),
            ],
        )
    }

    fn canceled(item: u64, tx: &str) -> ChainEvent {
        event(
            EventKind::MarketItemCanceled,
            tx,
            2,
            vec![("itemId", FieldValue::Uint(U256::from(item)))],
        )
    }

    fn setup(max_attempts: u32) -> (Arc<MemoryStore>, Reconciler) {
        let store = Arc::new(MemoryStore::new());
        let rec = Reconciler::new(store.clone(), max_attempts, Duration::ZERO);
        (store, rec)
    }

    #[tokio::test]
    async fn duplicate_created_is_noop() {
        let (store, rec) = setup(3);
        let ev = created(7, 100, "0xc1");
        assert_eq!(rec.apply(&ev).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(rec.apply(&ev).await.unwrap(), ReconcileOutcome::Duplicate);
        assert_eq!(store.listing_count(), 1);
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn created_then_sold() {
        let (store, rec) = setup(3);
        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        assert_eq!(rec.apply(&sold(7, 100, "0xs1")).await.unwrap(), ReconcileOutcome::Applied);

        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Sold);
        assert_eq!(listing.buyer.as_deref(), Some(BUYER));
        assert_eq!(listing.price.to_string(), "100");

        let sales: Vec<_> = store
            .all_transactions()
            .into_iter()
            .filter(|t| t.tx_type == TxType::Sale)
            .collect();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].value.to_string(), "100");

        let stats = store.stats(NFT).await.unwrap().unwrap();
        assert_eq!(stats.total_sales, 1);
        assert_eq!(stats.active_listings, 0);
    }

    #[tokio::test]
    async fn redelivered_sale_is_duplicate() {
        let (store, rec) = setup(3);
        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        assert_eq!(rec.apply(&sold(7, 100, "0xs1")).await.unwrap(), ReconcileOutcome::Duplicate);
        assert_eq!(rec.pending_len(), 0);
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn sale_before_creation_resolves() {
        let (store, rec) = setup(5);
        let outcome = rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deferred { attempts: 1 });
        assert_eq!(rec.pending_len(), 1);

        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        assert_eq!(rec.pending_len(), 0);
        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Sold);
        assert!(rec.store().anomalies(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_sale_becomes_anomaly() {
        let (store, rec) = setup(3);
        rec.apply(&sold(9, 100, "0xs9")).await.unwrap();
        assert_eq!(rec.retry_pending().await.unwrap(), 0);
        assert_eq!(rec.pending_len(), 1);
        rec.retry_pending().await.unwrap();
        assert_eq!(rec.pending_len(), 0);

        let anomalies = store.anomalies(10).await.unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].attempts, 3);
        assert_eq!(anomalies[0].item_id, Some(U256::from(9)));
        assert_eq!(anomalies[0].event_key, "0xs9:1");
    }

    #[tokio::test]
    async fn queued_event_is_not_queued_twice() {
        let (_store, rec) = setup(5);
        rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        let again = rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        assert_eq!(again, ReconcileOutcome::Deferred { attempts: 0 });
        assert_eq!(rec.pending_len(), 1);
    }

    #[tokio::test]
    async fn racing_parks_share_one_queue_slot() {
        let (store, rec) = setup(3);
        let ev = sold(7, 100, "0xs1");
        assert_eq!(rec.apply(&ev).await.unwrap(), ReconcileOutcome::Deferred { attempts: 1 });

        // A second worker that passed the queued check before the first parked.
        let second = PendingEvent {
            event: ev.clone(),
            attempts: 0,
            reason: String::new(),
            first_seen: Utc::now(),
            next_attempt: Instant::now(),
            in_flight: false,
        };
        let outcome = rec.park(second, "sale for unknown item 7".into()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deferred { attempts: 1 });
        assert_eq!(rec.pending_len(), 1);
        assert_eq!(store.deferred_events().await.unwrap().len(), 1);

        rec.retry_pending().await.unwrap();
        rec.retry_pending().await.unwrap();
        assert_eq!(rec.pending_len(), 0);
        assert_eq!(store.anomalies(10).await.unwrap().len(), 1);
        assert!(store.deferred_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parked_events_survive_a_restart() {
        let (store, rec) = setup(5);
        rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        let parked = store.deferred_events().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempts, 1);
        assert_eq!(rec.lowest_pending_block(), Some(100));
        drop(rec);

        let rec = Reconciler::new(store.clone(), 5, Duration::ZERO);
        assert_eq!(rec.lowest_pending_block(), None);
        assert_eq!(rec.restore_pending().await.unwrap(), 1);
        assert_eq!(rec.restore_pending().await.unwrap(), 0);
        assert_eq!(rec.lowest_pending_block(), Some(100));

        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        assert_eq!(rec.pending_len(), 0);
        assert!(store.deferred_events().await.unwrap().is_empty());
        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn retries_run_in_chain_order() {
        let (store, rec) = setup(5);
        let mut late = canceled(7, "0xx1");
        late.block_number = 120;
        let mut early = sold(7, 100, "0xs1");
        early.block_number = 110;
        rec.apply(&late).await.unwrap();
        rec.apply(&early).await.unwrap();

        store
            .insert_listing_if_absent(&ListingRecord::new_active(
                U256::from(7),
                NFT,
                U256::from(70),
                SELLER,
                Amount::from_u64(100),
                Utc::now(),
                None,
            ))
            .await
            .unwrap();
        rec.retry_pending().await.unwrap();

        // The sale at block 110 wins; the later cancel finds a sold listing.
        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Sold);
        assert_eq!(rec.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_create_then_cancel() {
        let (store, rec) = setup(3);
        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        assert_eq!(rec.apply(&canceled(7, "0xx1")).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(store.listing_count(), 1);
        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Cancelled);
        assert!(listing.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn no_event_reactivates_a_terminal_listing() {
        let (store, rec) = setup(2);
        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        rec.apply(&canceled(7, "0xx1")).await.unwrap();

        assert_eq!(rec.apply(&created(7, 100, "0xc1")).await.unwrap(), ReconcileOutcome::Duplicate);
        assert_eq!(rec.apply(&canceled(7, "0xx1")).await.unwrap(), ReconcileOutcome::Duplicate);
        // A sale for a cancelled listing never applies.
        rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        rec.retry_pending().await.unwrap();

        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Cancelled);
        assert!(listing.buyer.is_none());
        assert_eq!(store.anomalies(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_before_creation_resolves() {
        let (store, rec) = setup(3);
        rec.apply(&canceled(7, "0xx1")).await.unwrap();
        rec.apply(&created(7, 100, "0xc1")).await.unwrap();
        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_respects_delay() {
        let store = Arc::new(MemoryStore::new());
        let rec = Reconciler::new(store, 5, Duration::from_secs(3600));
        rec.apply(&sold(7, 100, "0xs1")).await.unwrap();
        assert_eq!(rec.retry_pending().await.unwrap(), 0);
        assert_eq!(rec.pending_len(), 1);
    }
}
