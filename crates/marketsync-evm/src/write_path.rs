//! Verified CRUD write path.
//!
//! Submissions coming from outside the event pipeline are checked with the
//! [`OnChainVerifier`] first and only then written through the same
//! reconciler entry points the event path uses. A mismatch rejects the
//! write; an unavailable chain is retried a bounded number of times and
//! then fails. Nothing is persisted without a positive verification.
//!
//! A verified sale is recorded under the key of its on-chain log, so the
//! `MarketItemSold` event arriving later is a duplicate of the same record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use marketsync_core::error::SyncError;
use marketsync_core::reconciler::{sale_from_event, Reconciler};
use marketsync_core::store::TransitionOutcome;
use marketsync_core::types::{
    normalize_address, ListingRecord, ListingStatus, MarketStats, TransactionRecord,
};

use crate::abi::OnChainItem;
use crate::verifier::{ListingClaim, OnChainVerifier, SaleClaim, Verification};

pub struct MarketService {
    verifier: OnChainVerifier,
    reconciler: Arc<Reconciler>,
    verify_attempts: u32,
    retry_backoff: Duration,
}

impl MarketService {
    pub fn new(
        verifier: OnChainVerifier,
        reconciler: Arc<Reconciler>,
        verify_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            verifier,
            reconciler,
            verify_attempts: verify_attempts.max(1),
            retry_backoff,
        }
    }

    // ─── Writes ─────────────────────────────────────────────────────────────

    /// Accept a listing once the contract confirms it. Returns the stored
    /// record, which is the existing one if the item was already projected.
    pub async fn submit_listing(&self, claim: &ListingClaim) -> Result<ListingRecord, SyncError> {
        let item = self
            .verified(claim.item_id, || self.verifier.verify_listing(claim))
            .await?;

        let listing = ListingRecord::new_active(
            claim.item_id,
            &item.nft_contract,
            item.token_id,
            &item.seller,
            item.price,
            listed_at(&item),
            None,
        );
        if self.reconciler.upsert_listing(&listing, None).await? {
            info!(item_id = %claim.item_id, seller = %listing.seller, "verified listing accepted");
        }
        self.require_listing(claim.item_id).await
    }

    /// Accept a sale once the contract shows the item sold to the buyer and
    /// the claimed transaction's receipt carries the matching sale log.
    pub async fn submit_sale(&self, claim: &SaleClaim) -> Result<ListingRecord, SyncError> {
        let verified = self
            .verified(claim.item_id, || self.verifier.verify_sale(claim))
            .await?;

        let listing = self.require_listing(claim.item_id).await?;
        let sale = sale_from_event(&verified.event, &listing, &claim.buyer, claim.price);

        match self.reconciler.apply_sale(&sale).await? {
            TransitionOutcome::Applied(listing) => {
                info!(item_id = %claim.item_id, buyer = %sale.buyer, "verified sale accepted");
                Ok(listing)
            }
            TransitionOutcome::Terminal(listing)
                if listing.status == ListingStatus::Sold
                    && listing.sale_tx_hash.as_deref() == Some(sale.tx.key.tx_hash.as_str()) =>
            {
                Ok(listing)
            }
            TransitionOutcome::Terminal(listing) => Err(SyncError::InvalidState(format!(
                "item {} is already {}",
                claim.item_id, listing.status
            ))),
            TransitionOutcome::Missing => Err(not_found(claim.item_id)),
        }
    }

    /// Cancel an active listing on behalf of its seller.
    pub async fn cancel_listing(&self, item_id: U256, caller: &str) -> Result<ListingRecord, SyncError> {
        let listing = self.require_listing(item_id).await?;
        if normalize_address(caller) != listing.seller {
            warn!(%item_id, caller, "cancel rejected, caller is not the seller");
            return Err(SyncError::Unauthorized(format!(
                "only the seller may cancel item {item_id}"
            )));
        }
        if listing.status != ListingStatus::Active {
            return Err(SyncError::InvalidState(format!(
                "item {item_id} is {}, not active",
                listing.status
            )));
        }

        match self.reconciler.apply_cancel(item_id, Utc::now(), None).await? {
            TransitionOutcome::Applied(listing) => {
                info!(%item_id, "listing cancelled by seller");
                Ok(listing)
            }
            TransitionOutcome::Terminal(listing) => Err(SyncError::InvalidState(format!(
                "item {item_id} is {}, not active",
                listing.status
            ))),
            TransitionOutcome::Missing => Err(not_found(item_id)),
        }
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub async fn listing(&self, item_id: U256) -> Result<Option<ListingRecord>, SyncError> {
        self.reconciler.store().listing(item_id).await
    }

    pub async fn listings(&self, nft_contract: &str) -> Result<Vec<ListingRecord>, SyncError> {
        self.reconciler.store().listings_by_contract(nft_contract).await
    }

    pub async fn transactions(&self, nft_contract: &str) -> Result<Vec<TransactionRecord>, SyncError> {
        self.reconciler.store().transactions_by_contract(nft_contract).await
    }

    pub async fn stats(&self, nft_contract: &str) -> Result<Option<MarketStats>, SyncError> {
        self.reconciler.store().stats(nft_contract).await
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    async fn verified<T, F, Fut>(&self, item_id: U256, mut verify: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Verification<T>>,
    {
        let mut last_reason = String::new();
        for attempt in 1..=self.verify_attempts {
            match verify().await {
                Verification::Match(item) => return Ok(item),
                Verification::Mismatch { field, expected, actual } => {
                    warn!(%item_id, field, %expected, %actual, "submission contradicts chain state");
                    return Err(SyncError::VerificationMismatch {
                        field: field.to_string(),
                        expected,
                        actual,
                    });
                }
                Verification::Unavailable(reason) => {
                    warn!(%item_id, attempt, %reason, "verification unavailable");
                    last_reason = reason;
                    if attempt < self.verify_attempts {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }
        Err(SyncError::VerificationUnavailable(last_reason))
    }

    async fn require_listing(&self, item_id: U256) -> Result<ListingRecord, SyncError> {
        self.reconciler
            .store()
            .listing(item_id)
            .await?
            .ok_or_else(|| not_found(item_id))
    }
}

fn not_found(item_id: U256) -> SyncError {
    SyncError::NotFound {
        entity: "listing",
        id: item_id.to_string(),
    }
}

fn listed_at(item: &OnChainItem) -> DateTime<Utc> {
    u64::try_from(item.listed_at)
        .ok()
        .and_then(|s| i64::try_from(s).ok())
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gateway::MockGateway;
    use marketsync_core::memory::MemoryStore;
    use crate::mock_gateway::LogFactory;
    use marketsync_core::store::ProjectionStore;
    use marketsync_core::types::{Amount, TxKey, TxType};
    use marketsync_core::ReconcileOutcome;

    const MARKET: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const NFT: &str = "0x00000000000000000000000000000000000000aa";
    const SELLER_A: &str = "0x00000000000000000000000000000000000000a1";
    const SELLER_B: &str = "0x00000000000000000000000000000000000000b2";
    const BUYER: &str = "0x00000000000000000000000000000000000000bb";

    fn on_chain(sold: bool) -> OnChainItem {
        OnChainItem {
            item_id: U256::from(7),
            nft_contract: NFT.into(),
            token_id: U256::from(42),
            seller: SELLER_B.into(),
            owner: if sold { BUYER.into() } else { MARKET.into() },
            price: Amount::from_u64(100),
            sold,
            listed_at: U256::from(1_700_000_000u64),
        }
    }

    fn claim(seller: &str) -> ListingClaim {
        ListingClaim {
            item_id: U256::from(7),
            nft_contract: NFT.into(),
            token_id: U256::from(42),
            seller: seller.into(),
            price: Amount::from_u64(100),
        }
    }

    fn sale_claim(tx_hash: &str) -> SaleClaim {
        SaleClaim {
            item_id: U256::from(7),
            buyer: BUYER.into(),
            price: Amount::from_u64(100),
            tx_hash: tx_hash.into(),
        }
    }

    fn service(gw: Arc<MockGateway>) -> (Arc<MemoryStore>, MarketService) {
        let store = Arc::new(MemoryStore::new());
        let rec = Arc::new(Reconciler::new(store.clone(), 3, Duration::ZERO));
        let verifier = OnChainVerifier::new(gw, MARKET, Duration::from_millis(200));
        (store, MarketService::new(verifier, rec, 3, Duration::ZERO))
    }

    #[tokio::test]
    async fn verified_listing_is_persisted() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        let (store, svc) = service(gw);

        let listing = svc.submit_listing(&claim(SELLER_B)).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(listing.listed_at.timestamp(), 1_700_000_000);
        assert!(listing.tx_hash.is_none());
        assert_eq!(store.listing_count(), 1);
        assert_eq!(svc.stats(NFT).await.unwrap().unwrap().active_listings, 1);
    }

    #[tokio::test]
    async fn mismatched_seller_is_rejected_and_not_persisted() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        let (store, svc) = service(gw);

        let err = svc.submit_listing(&claim(SELLER_A)).await.unwrap_err();
        assert!(matches!(err, SyncError::VerificationMismatch { ref field, .. } if field == "seller"));
        assert_eq!(store.listing_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_chain_is_retried_then_fails() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        gw.fail_calls(5);
        let (store, svc) = service(gw.clone());

        let err = svc.submit_listing(&claim(SELLER_B)).await.unwrap_err();
        assert!(matches!(err, SyncError::VerificationUnavailable(_)));
        assert_eq!(gw.call_count(), 3);
        assert_eq!(store.listing_count(), 0);
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        gw.fail_calls(2);
        let (_store, svc) = service(gw.clone());
        assert!(svc.submit_listing(&claim(SELLER_B)).await.is_ok());
        assert_eq!(gw.call_count(), 3);
    }

    #[tokio::test]
    async fn verified_sale_marks_listing_sold() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        let (store, svc) = service(gw.clone());
        svc.submit_listing(&claim(SELLER_B)).await.unwrap();

        gw.set_item(on_chain(true));
        gw.set_receipt("0xs1", vec![LogFactory::new(MARKET).sold(7, BUYER, 100, 150, "0xs1", 3)]);
        let sold = svc.submit_sale(&sale_claim("0xS1")).await.unwrap();
        assert_eq!(sold.status, ListingStatus::Sold);
        assert_eq!(sold.buyer.as_deref(), Some(BUYER));

        // Resubmitting the same sale is idempotent.
        assert!(svc.submit_sale(&sale_claim("0xs1")).await.is_ok());
        let tx = store
            .transaction(&TxKey::chain("0xs1", 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.tx_type, TxType::Sale);
        assert_eq!(tx.block_number, Some(150));
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn sale_with_an_unmined_hash_is_not_persisted() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        let (store, svc) = service(gw.clone());
        svc.submit_listing(&claim(SELLER_B)).await.unwrap();
        gw.set_item(on_chain(true));

        let err = svc.submit_sale(&sale_claim("0xfabricated")).await.unwrap_err();
        assert!(matches!(err, SyncError::VerificationUnavailable(_)));

        // A mined transaction that is not this sale.
        gw.set_receipt("0xunrelated", vec![LogFactory::new(MARKET).canceled(9, 150, "0xunrelated", 0)]);
        let err = svc.submit_sale(&sale_claim("0xunrelated")).await.unwrap_err();
        assert!(matches!(err, SyncError::VerificationMismatch { ref field, .. } if field == "txHash"));

        let listing = store.listing(U256::from(7)).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn verified_sale_and_its_chain_event_share_one_record() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        let (store, svc) = service(gw.clone());
        svc.submit_listing(&claim(SELLER_B)).await.unwrap();

        let log = LogFactory::new(MARKET).sold(7, BUYER, 100, 150, "0xs1", 3);
        gw.set_item(on_chain(true));
        gw.set_receipt("0xs1", vec![log.clone()]);
        svc.submit_sale(&sale_claim("0xs1")).await.unwrap();

        let event = crate::decoder::EventDecoder::new().decode(&log).unwrap();
        assert_eq!(svc.reconciler.apply(&event).await.unwrap(), ReconcileOutcome::Duplicate);

        let sales: Vec<_> = store
            .all_transactions()
            .into_iter()
            .filter(|t| t.tx_type == TxType::Sale)
            .collect();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].key, TxKey::chain("0xs1", 3));
        assert!(store.anomalies(10).await.unwrap().is_empty());
        assert_eq!(svc.reconciler.pending_len(), 0);
    }

    #[tokio::test]
    async fn cancel_requires_the_seller() {
        let gw = Arc::new(MockGateway::new());
        gw.set_item(on_chain(false));
        let (_store, svc) = service(gw);
        svc.submit_listing(&claim(SELLER_B)).await.unwrap();

        let err = svc.cancel_listing(U256::from(7), SELLER_A).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));

        let cancelled = svc.cancel_listing(U256::from(7), SELLER_B).await.unwrap();
        assert_eq!(cancelled.status, ListingStatus::Cancelled);

        let err = svc.cancel_listing(U256::from(7), SELLER_B).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        let err = svc.cancel_listing(U256::from(8), SELLER_B).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }
}
