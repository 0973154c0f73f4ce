//! In-memory projection store for tests and ephemeral runs.
//!
//! All state sits behind a single mutex, so every trait call is trivially
//! atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::store::{ProjectionStore, SyncStateStore, TransitionOutcome};
use crate::types::{
    normalize_address, Anomaly, DeferredEvent, ListingRecord, ListingStatus, MarketStats, SaleUpdate, SyncState,
    TransactionRecord, TxKey, TxStatus,
};

#[derive(Default)]
struct Inner {
    listings: BTreeMap<U256, ListingRecord>,
    transactions: BTreeMap<TxKey, TransactionRecord>,
    stats: HashMap<String, MarketStats>,
    anomalies: HashMap<String, Anomaly>,
    sync_states: HashMap<String, SyncState>,
    deferred: BTreeMap<TxKey, DeferredEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listing_count(&self) -> usize {
        self.lock().listings.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Every stored transaction, ordered by key.
    pub fn all_transactions(&self) -> Vec<TransactionRecord> {
        self.lock().transactions.values().cloned().collect()
    }
}

#[async_trait]
impl ProjectionStore for MemoryStore {
    async fn insert_listing_if_absent(&self, listing: &ListingRecord) -> Result<bool, SyncError> {
        let mut inner = self.lock();
        if inner.listings.contains_key(&listing.item_id) {
            return Ok(false);
        }
        inner.listings.insert(listing.item_id, listing.clone());
        Ok(true)
    }

    async fn listing(&self, item_id: U256) -> Result<Option<ListingRecord>, SyncError> {
        Ok(self.lock().listings.get(&item_id).cloned())
    }

    async fn record_sale(&self, sale: &SaleUpdate) -> Result<TransitionOutcome, SyncError> {
        let mut inner = self.lock();
        let Some(listing) = inner.listings.get_mut(&sale.item_id) else {
            return Ok(TransitionOutcome::Missing);
        };
        if !listing.mark_sold(sale) {
            return Ok(TransitionOutcome::Terminal(listing.clone()));
        }
        let updated = listing.clone();
        inner
            .transactions
            .entry(sale.tx.key.clone())
            .or_insert_with(|| sale.tx.clone());
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn cancel_listing(
        &self,
        item_id: U256,
        at: DateTime<Utc>,
        tx: Option<&TransactionRecord>,
    ) -> Result<TransitionOutcome, SyncError> {
        let mut inner = self.lock();
        let Some(listing) = inner.listings.get_mut(&item_id) else {
            return Ok(TransitionOutcome::Missing);
        };
        if !listing.mark_cancelled(at) {
            return Ok(TransitionOutcome::Terminal(listing.clone()));
        }
        let updated = listing.clone();
        if let Some(tx) = tx {
            inner
                .transactions
                .entry(tx.key.clone())
                .or_insert_with(|| tx.clone());
        }
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn listings_by_contract(
        &self,
        nft_contract: &str,
    ) -> Result<Vec<ListingRecord>, SyncError> {
        let contract = normalize_address(nft_contract);
        Ok(self
            .lock()
            .listings
            .values()
            .filter(|l| l.nft_contract == contract)
            .cloned()
            .collect())
    }

    async fn active_listings_by_price(
        &self,
        nft_contract: &str,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, SyncError> {
        let contract = normalize_address(nft_contract);
        let mut active: Vec<ListingRecord> = self
            .lock()
            .listings
            .values()
            .filter(|l| l.nft_contract == contract && l.status == ListingStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.price.cmp(&b.price).then(a.item_id.cmp(&b.item_id)));
        active.truncate(limit);
        Ok(active)
    }

    async fn insert_transaction_if_absent(
        &self,
        tx: &TransactionRecord,
    ) -> Result<bool, SyncError> {
        let mut inner = self.lock();
        if inner.transactions.contains_key(&tx.key) {
            return Ok(false);
        }
        inner.transactions.insert(tx.key.clone(), tx.clone());
        Ok(true)
    }

    async fn transaction(&self, key: &TxKey) -> Result<Option<TransactionRecord>, SyncError> {
        Ok(self.lock().transactions.get(key).cloned())
    }

    async fn set_transaction_status(
        &self,
        key: &TxKey,
        status: TxStatus,
    ) -> Result<bool, SyncError> {
        let mut inner = self.lock();
        match inner.transactions.get_mut(key) {
            Some(tx) if tx.status.can_transition_to(status) => {
                tx.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transactions_by_contract(
        &self,
        nft_contract: &str,
    ) -> Result<Vec<TransactionRecord>, SyncError> {
        let contract = normalize_address(nft_contract);
        Ok(self
            .lock()
            .transactions
            .values()
            .filter(|t| t.nft_contract.as_deref() == Some(contract.as_str()))
            .cloned()
            .collect())
    }

    async fn save_stats(&self, stats: &MarketStats) -> Result<(), SyncError> {
        self.lock()
            .stats
            .insert(stats.nft_contract.clone(), stats.clone());
        Ok(())
    }

    async fn stats(&self, nft_contract: &str) -> Result<Option<MarketStats>, SyncError> {
        Ok(self.lock().stats.get(&normalize_address(nft_contract)).cloned())
    }

    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<(), SyncError> {
        self.lock()
            .anomalies
            .insert(anomaly.event_key.clone(), anomaly.clone());
        Ok(())
    }

    async fn anomalies(&self, limit: usize) -> Result<Vec<Anomaly>, SyncError> {
        let mut all: Vec<Anomaly> = self.lock().anomalies.values().cloned().collect();
        all.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn save_deferred(&self, deferred: &DeferredEvent) -> Result<(), SyncError> {
        self.lock().deferred.insert(deferred.key(), deferred.clone());
        Ok(())
    }

    async fn remove_deferred(&self, key: &TxKey) -> Result<(), SyncError> {
        self.lock().deferred.remove(key);
        Ok(())
    }

    async fn deferred_events(&self) -> Result<Vec<DeferredEvent>, SyncError> {
        let mut all: Vec<DeferredEvent> = self.lock().deferred.values().cloned().collect();
        all.sort_by_key(|d| (d.event.block_number, d.event.log_index));
        Ok(all)
    }
}

#[async_trait]
impl SyncStateStore for MemoryStore {
    async fn load(&self, contract_address: &str) -> Result<Option<SyncState>, SyncError> {
        Ok(self
            .lock()
            .sync_states
            .get(&normalize_address(contract_address))
            .cloned())
    }

    async fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        self.lock()
            .sync_states
            .insert(normalize_address(&state.contract_address), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Amount, ChainEvent, EventKind, TxType};

    fn listing(id: u64) -> ListingRecord {
        ListingRecord::new_active(
            U256::from(id),
            "0xAA",
            U256::from(1),
            "0x01",
            Amount::from_u64(100),
            Utc::now(),
            Some("0xc1".into()),
        )
    }

    fn sale_tx(hash: &str) -> TransactionRecord {
        TransactionRecord {
            key: TxKey::chain(hash, 0),
            tx_type: TxType::Sale,
            item_id: Some(U256::from(7)),
            nft_contract: Some("0xaa".into()),
            token_id: Some(U256::from(1)),
            from_address: Some("0x01".into()),
            to_address: Some("0xbb".into()),
            value: Amount::from_u64(100),
            platform_fee: Amount::ZERO,
            block_number: Some(10),
            block_timestamp: None,
            status: TxStatus::Confirmed,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn listing_insert_is_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.insert_listing_if_absent(&listing(7)).await.unwrap());

        let mut other = listing(7);
        other.price = Amount::from_u64(1);
        assert!(!store.insert_listing_if_absent(&other).await.unwrap());

        let stored = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(stored.price, Amount::from_u64(100));
        assert_eq!(store.listing_count(), 1);
    }

    #[tokio::test]
    async fn sale_transition_is_conditional() {
        let store = MemoryStore::new();
        let sale = SaleUpdate {
            item_id: U256::from(7),
            buyer: "0xBB".into(),
            sold_at: Utc::now(),
            tx: sale_tx("0xs1"),
        };
        assert_eq!(store.record_sale(&sale).await.unwrap(), TransitionOutcome::Missing);
        assert_eq!(store.transaction_count(), 0);

        store.insert_listing_if_absent(&listing(7)).await.unwrap();
        let TransitionOutcome::Applied(sold) = store.record_sale(&sale).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(sold.status, ListingStatus::Sold);
        assert_eq!(sold.buyer.as_deref(), Some("0xbb"));
        assert_eq!(store.transaction_count(), 1);

        let again = store.record_sale(&sale).await.unwrap();
        assert!(matches!(again, TransitionOutcome::Terminal(_)));
        assert_eq!(store.transaction_count(), 1);

        let cancel = store.cancel_listing(U256::from(7), Utc::now(), None).await.unwrap();
        assert!(matches!(cancel, TransitionOutcome::Terminal(l) if l.status == ListingStatus::Sold));
    }

    #[tokio::test]
    async fn transaction_status_updates() {
        let store = MemoryStore::new();
        let mut tx = sale_tx("0xp");
        tx.status = TxStatus::Pending;
        store.insert_transaction_if_absent(&tx).await.unwrap();
        assert!(!store.insert_transaction_if_absent(&tx).await.unwrap());

        assert!(store.set_transaction_status(&tx.key, TxStatus::Confirmed).await.unwrap());
        assert!(!store.set_transaction_status(&tx.key, TxStatus::Failed).await.unwrap());
        let stored = store.transaction(&tx.key).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn cheapest_active_listings_order_by_numeric_price() {
        let store = MemoryStore::new();
        for (id, price) in [(1u64, 100u64), (2, 9), (3, 1_000), (4, 50)] {
            let mut l = listing(id);
            l.price = Amount::from_u64(price);
            store.insert_listing_if_absent(&l).await.unwrap();
        }
        store.cancel_listing(U256::from(4), Utc::now(), None).await.unwrap();

        let cheapest = store.active_listings_by_price("0xaa", 2).await.unwrap();
        let prices: Vec<Amount> = cheapest.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![Amount::from_u64(9), Amount::from_u64(100)]);
    }

    #[tokio::test]
    async fn deferred_events_upsert_by_key() {
        let store = MemoryStore::new();
        let parked = |block: u64, attempts: u32| DeferredEvent {
            event: ChainEvent {
                kind: EventKind::MarketItemCanceled,
                contract_address: "0xm".into(),
                block_number: block,
                log_index: 0,
                tx_hash: format!("0x{block:x}"),
                block_timestamp: None,
                fields: Default::default(),
            },
            attempts,
            reason: "listing not found".into(),
            first_seen: Utc::now(),
        };

        store.save_deferred(&parked(20, 1)).await.unwrap();
        store.save_deferred(&parked(10, 1)).await.unwrap();
        store.save_deferred(&parked(20, 2)).await.unwrap();

        let all = store.deferred_events().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event.block_number, 10);
        assert_eq!(all[1].attempts, 2);

        store.remove_deferred(&all[0].key()).await.unwrap();
        assert_eq!(store.deferred_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_state_roundtrip() {
        let store = MemoryStore::new();
        assert!(SyncStateStore::load(&store, "0xM").await.unwrap().is_none());
        let state = SyncState {
            contract_address: "0xm".into(),
            last_synced_block: 42,
            last_synced_at: Utc::now(),
            status: crate::types::SyncStatus::Active,
            last_error: None,
        };
        SyncStateStore::save(&store, &state).await.unwrap();
        let loaded = SyncStateStore::load(&store, "0xM").await.unwrap().unwrap();
        assert_eq!(loaded.last_synced_block, 42);
    }
}
