//! Aggregate statistics, recomputed in full from the stored records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::SyncError;
use crate::store::ProjectionStore;
use crate::types::{normalize_address, MarketStats};

#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn ProjectionStore>,
    /// One lock per collection: a recompute holds it from the first read to
    /// the save, so an older snapshot never overwrites a newer one.
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        Self {
            store,
            locks: Arc::default(),
        }
    }

    fn lock_for(&self, nft_contract: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(normalize_address(nft_contract))
            .or_default()
            .clone()
    }

    /// Rebuild and persist the aggregates for `nft_contract`.
    pub async fn recompute(&self, nft_contract: &str) -> Result<MarketStats, SyncError> {
        let lock = self.lock_for(nft_contract);
        let _guard = lock.lock().await;
        let listings = self.store.listings_by_contract(nft_contract).await?;
        let transactions = self.store.transactions_by_contract(nft_contract).await?;
        let stats = MarketStats::compute(nft_contract, &listings, &transactions);
        self.store.save_stats(&stats).await?;
        debug!(
            nft_contract = %stats.nft_contract,
            active = stats.active_listings,
            floor = ?stats.floor_price.map(|p| p.to_string()),
            volume = %stats.total_volume,
            "stats recomputed"
        );
        Ok(stats)
    }
}
