//! Persistence traits for the off-chain projection.
//!
//! Implementations: [`MemoryStore`](crate::memory::MemoryStore),
//! `SqliteStore` and `PostgresStore` (in `marketsync-storage`).
//!
//! Every write keyed by a natural key is first-writer-wins. Status changes
//! are conditional updates (`WHERE status = 'active'`) so concurrent workers
//! touching the same `item_id` cannot lose an update.

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::types::{
    Anomaly, DeferredEvent, ListingRecord, MarketStats, SaleUpdate, SyncState, TransactionRecord, TxKey, TxStatus,
};

/// Result of a conditional status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The listing was `active` and now carries the new status.
    Applied(ListingRecord),
    /// No listing with that `item_id` exists.
    Missing,
    /// The listing is already `sold` or `cancelled`; nothing changed.
    Terminal(ListingRecord),
}

#[async_trait]
pub trait ProjectionStore: Send + Sync {
    // ─── Listings ─────────────────────────────────────────────────────────

    /// Insert `listing` unless a record with its `item_id` exists.
    /// Returns `true` if the row was written.
    async fn insert_listing_if_absent(&self, listing: &ListingRecord) -> Result<bool, SyncError>;

    async fn listing(&self, item_id: U256) -> Result<Option<ListingRecord>, SyncError>;

    /// Atomically move an `active` listing to `sold` and append the sale
    /// transaction. The transaction is only written when the transition
    /// applies.
    async fn record_sale(&self, sale: &SaleUpdate) -> Result<TransitionOutcome, SyncError>;

    /// Atomically move an `active` listing to `cancelled`, appending `tx`
    /// when given and the transition applies.
    async fn cancel_listing(
        &self,
        item_id: U256,
        at: DateTime<Utc>,
        tx: Option<&TransactionRecord>,
    ) -> Result<TransitionOutcome, SyncError>;

    async fn listings_by_contract(&self, nft_contract: &str)
        -> Result<Vec<ListingRecord>, SyncError>;

    /// Active listings of `nft_contract`, cheapest first, ordered by the
    /// numeric value of `price`.
    async fn active_listings_by_price(
        &self,
        nft_contract: &str,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, SyncError>;

    // ─── Transactions ─────────────────────────────────────────────────────

    /// Append `tx` unless its key exists. Returns `true` if written.
    async fn insert_transaction_if_absent(&self, tx: &TransactionRecord)
        -> Result<bool, SyncError>;

    async fn transaction(&self, key: &TxKey) -> Result<Option<TransactionRecord>, SyncError>;

    /// Move a `pending` transaction to `confirmed` or `failed`. Returns
    /// `false` if the record is missing or not pending.
    async fn set_transaction_status(&self, key: &TxKey, status: TxStatus)
        -> Result<bool, SyncError>;

    async fn transactions_by_contract(
        &self,
        nft_contract: &str,
    ) -> Result<Vec<TransactionRecord>, SyncError>;

    // ─── Aggregates ───────────────────────────────────────────────────────

    /// Replace the stored aggregates for `stats.nft_contract`.
    async fn save_stats(&self, stats: &MarketStats) -> Result<(), SyncError>;

    async fn stats(&self, nft_contract: &str) -> Result<Option<MarketStats>, SyncError>;

    // ─── Anomalies ────────────────────────────────────────────────────────

    /// Record an unresolved event. Re-recording the same event key
    /// overwrites the previous entry.
    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<(), SyncError>;

    /// Most recent anomalies first.
    async fn anomalies(&self, limit: usize) -> Result<Vec<Anomaly>, SyncError>;

    // ─── Retry queue ──────────────────────────────────────────────────────

    /// Upsert a parked event, keyed by its event key.
    async fn save_deferred(&self, deferred: &DeferredEvent) -> Result<(), SyncError>;

    /// Drop a parked event once it resolved or became an anomaly.
    async fn remove_deferred(&self, key: &TxKey) -> Result<(), SyncError>;

    /// Every parked event, in chain order.
    async fn deferred_events(&self) -> Result<Vec<DeferredEvent>, SyncError>;
}

/// Storage for the per-contract catch-up checkpoint.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn load(&self, contract_address: &str) -> Result<Option<SyncState>, SyncError>;

    /// Upsert the row for `state.contract_address`.
    async fn save(&self, state: &SyncState) -> Result<(), SyncError>;
}
