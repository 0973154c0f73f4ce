//! On-Chain Verifier: checks externally submitted facts against
//! `getMarketItem` before the write path may persist them. A sale is also
//! checked against its transaction receipt, which must carry the matching
//! `MarketItemSold` log.
//!
//! Reads are bounded by a timeout. Any RPC failure, timeout or malformed
//! response is reported as [`Verification::Unavailable`], never as a match.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use tracing::{debug, warn};

use marketsync_core::gateway::ChainGateway;
use marketsync_core::types::{normalize_address, Amount, ChainEvent, EventKind, MarketEvent};

use crate::abi::{self, OnChainItem};
use crate::decoder::EventDecoder;

/// A listing as claimed by a CRUD submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingClaim {
    pub item_id: U256,
    pub nft_contract: String,
    pub token_id: U256,
    pub seller: String,
    pub price: Amount,
}

/// A sale as claimed by a CRUD submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleClaim {
    pub item_id: U256,
    pub buyer: String,
    pub price: Amount,
    pub tx_hash: String,
}

/// A sale confirmed by both the contract state and its receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSale {
    pub item: OnChainItem,
    /// The `MarketItemSold` log found in the receipt.
    pub event: ChainEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification<T = OnChainItem> {
    /// Every checked field agrees with the chain.
    Match(T),
    /// The first field that disagrees.
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    /// The contract could not be read.
    Unavailable(String),
}

impl<T> Verification<T> {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }
}

pub struct OnChainVerifier {
    gateway: Arc<dyn ChainGateway>,
    marketplace: String,
    timeout: Duration,
    decoder: EventDecoder,
}

impl OnChainVerifier {
    pub fn new(gateway: Arc<dyn ChainGateway>, marketplace: &str, timeout: Duration) -> Self {
        Self {
            gateway,
            marketplace: normalize_address(marketplace),
            timeout,
            decoder: EventDecoder::new(),
        }
    }

    /// Read `getMarketItem(item_id)`.
    pub async fn fetch_item(&self, item_id: U256) -> Result<OnChainItem, String> {
        let input = abi::encode_get_market_item(item_id);
        let output = tokio::time::timeout(self.timeout, self.gateway.call(&self.marketplace, &input))
            .await
            .map_err(|_| format!("getMarketItem({item_id}) timed out after {}ms", self.timeout.as_millis()))?
            .map_err(|e| format!("getMarketItem({item_id}) failed: {e}"))?;
        abi::decode_get_market_item(&output).map_err(|e| format!("getMarketItem({item_id}): {e}"))
    }

    pub async fn verify_listing(&self, claim: &ListingClaim) -> Verification {
        let item = match self.fetch(claim.item_id).await {
            Ok(item) => item,
            Err(v) => return v,
        };
        let checks = [
            check_address("nftContract", &claim.nft_contract, &item.nft_contract),
            check("tokenId", claim.token_id, item.token_id),
            check_address("seller", &claim.seller, &item.seller),
            check("price", claim.price, item.price),
            check("sold", false, item.sold),
        ];
        first_mismatch(claim.item_id, checks).unwrap_or(Verification::Match(item))
    }

    pub async fn verify_sale(&self, claim: &SaleClaim) -> Verification<VerifiedSale> {
        let item = match self.fetch(claim.item_id).await {
            Ok(item) => item,
            Err(v) => return v,
        };
        let checks = [
            check("sold", true, item.sold),
            check_address("owner", &claim.buyer, &item.owner),
            check("price", claim.price, item.price),
        ];
        if let Some(mismatch) = first_mismatch(claim.item_id, checks) {
            return mismatch;
        }
        match self.sale_event(claim).await {
            Ok(event) => Verification::Match(VerifiedSale { item, event }),
            Err(v) => v,
        }
    }

    /// Fetch the item and turn "never created" into a mismatch on `itemId`.
    async fn fetch<T>(&self, item_id: U256) -> Result<OnChainItem, Verification<T>> {
        let item = self.fetch_item(item_id).await.map_err(|reason| {
            warn!(%item_id, %reason, "on-chain verification unavailable");
            Verification::Unavailable(reason)
        })?;
        if !item.exists() {
            return Err(Verification::Mismatch {
                field: "itemId",
                expected: item_id.to_string(),
                actual: item.item_id.to_string(),
            });
        }
        Ok(item)
    }

    /// Find the claimed sale in the receipt of `claim.tx_hash`.
    async fn sale_event(&self, claim: &SaleClaim) -> Result<ChainEvent, Verification<VerifiedSale>> {
        let tx_hash = claim.tx_hash.trim().to_ascii_lowercase();
        let receipt = tokio::time::timeout(self.timeout, self.gateway.transaction_receipt(&tx_hash))
            .await
            .map_err(|_| {
                Verification::Unavailable(format!(
                    "receipt for {tx_hash} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| Verification::Unavailable(format!("receipt for {tx_hash} failed: {e}")))?
            .ok_or_else(|| {
                warn!(item_id = %claim.item_id, %tx_hash, "no receipt for claimed sale");
                Verification::Unavailable(format!("no mined transaction {tx_hash}"))
            })?;

        if !receipt.succeeded() {
            return Err(Verification::Mismatch {
                field: "txStatus",
                expected: "0x1".into(),
                actual: receipt.status.unwrap_or_default(),
            });
        }

        let event = receipt
            .logs
            .iter()
            .filter(|log| !log.is_removed() && normalize_address(&log.address) == self.marketplace)
            .filter_map(|log| self.decoder.decode(log).ok())
            .find(|ev| ev.kind == EventKind::MarketItemSold && ev.item_id() == Some(claim.item_id))
            .ok_or_else(|| Verification::Mismatch {
                field: "txHash",
                expected: format!("MarketItemSold for item {}", claim.item_id),
                actual: tx_hash.clone(),
            })?;

        let Ok(MarketEvent::Sold { buyer, price, .. }) = event.market_event() else {
            return Err(Verification::Unavailable(format!("undecodable sale log in {tx_hash}")));
        };
        let checks = [
            check_address("buyer", &claim.buyer, &buyer),
            check("price", claim.price, price),
        ];
        match first_mismatch(claim.item_id, checks) {
            Some(mismatch) => Err(mismatch),
            None => Ok(event),
        }
    }
}

fn first_mismatch<T, const N: usize>(
    item_id: U256,
    checks: [Option<Verification<T>>; N],
) -> Option<Verification<T>> {
    let mismatch = checks.into_iter().flatten().next()?;
    if let Verification::Mismatch { field, expected, actual } = &mismatch {
        debug!(%item_id, field, %expected, %actual, "claim rejected by chain state");
    }
    Some(mismatch)
}

fn check<V: PartialEq + ToString, T>(
    field: &'static str,
    expected: V,
    actual: V,
) -> Option<Verification<T>> {
    (expected != actual).then(|| Verification::Mismatch {
        field,
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}

fn check_address<T>(field: &'static str, expected: &str, actual: &str) -> Option<Verification<T>> {
    check(field, normalize_address(expected), normalize_address(actual))
}
