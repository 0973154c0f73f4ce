//! Shared types for the sync pipeline: decoded events and the persisted
//! projection records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DecodeError;

/// Lowercases an address and makes sure it carries a `0x` prefix.
pub fn normalize_address(addr: &str) -> String {
    let trimmed = addr.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

// ─── Amount ───────────────────────────────────────────────────────────────────

/// Width of the zero-padded sort key; a `uint256` has at most 78 decimal digits.
pub const AMOUNT_SORT_WIDTH: usize = 78;

/// An arbitrary-precision token amount (wei).
///
/// Serialized as a decimal string. Stored alongside a fixed-width sort key
/// so backends without a 256-bit numeric type can still order by price.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn from_u64(v: u64) -> Self {
        Self(U256::from(v))
    }

    /// Parse a decimal string.
    pub fn parse_decimal(s: &str) -> Result<Self, DecodeError> {
        U256::from_str_radix(s.trim(), 10)
            .map(Self)
            .map_err(|_| DecodeError::Overflow(s.to_string()))
    }

    /// Zero-padded decimal string; lexicographic order equals numeric order.
    pub fn sort_key(&self) -> String {
        format!("{:0>width$}", self.0.to_string(), width = AMOUNT_SORT_WIDTH)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_decimal(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_decimal(&s).map_err(serde::de::Error::custom)
    }
}

// ─── Decoded events ───────────────────────────────────────────────────────────

/// The marketplace event topics the engine watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    MarketItemCreated,
    MarketItemSold,
    MarketItemCanceled,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::MarketItemCreated,
        EventKind::MarketItemSold,
        EventKind::MarketItemCanceled,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::MarketItemCreated => "MarketItemCreated",
            Self::MarketItemSold => "MarketItemSold",
            Self::MarketItemCanceled => "MarketItemCanceled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed field value taken from a log's topics or data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Uint(U256),
    /// Lowercase `0x` address.
    Address(String),
    Bool(bool),
}

/// A decoded log entry. Immutable; identified by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub kind: EventKind,
    /// Emitting contract (the marketplace).
    pub contract_address: String,
    pub block_number: u64,
    pub log_index: u32,
    pub tx_hash: String,
    /// Block timestamp (unix seconds) when the source provided it.
    pub block_timestamp: Option<i64>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ChainEvent {
    /// Natural key of this event.
    pub fn key(&self) -> TxKey {
        TxKey::chain(&self.tx_hash, self.log_index)
    }

    pub fn uint(&self, name: &str) -> Result<U256, DecodeError> {
        match self.fields.get(name) {
            Some(FieldValue::Uint(v)) => Ok(*v),
            Some(_) => Err(DecodeError::FieldType {
                field: name.to_string(),
                expected: "uint",
            }),
            None => Err(DecodeError::MissingField(name.to_string())),
        }
    }

    pub fn address(&self, name: &str) -> Result<String, DecodeError> {
        match self.fields.get(name) {
            Some(FieldValue::Address(v)) => Ok(v.clone()),
            Some(_) => Err(DecodeError::FieldType {
                field: name.to_string(),
                expected: "address",
            }),
            None => Err(DecodeError::MissingField(name.to_string())),
        }
    }

    /// The `itemId` every marketplace event carries, if present.
    pub fn item_id(&self) -> Option<U256> {
        self.uint("itemId").ok()
    }

    pub fn block_time(&self) -> Option<DateTime<Utc>> {
        self.block_timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
    }

    /// Project the generic field map onto the typed marketplace event.
    pub fn market_event(&self) -> Result<MarketEvent, DecodeError> {
        Ok(match self.kind {
            EventKind::MarketItemCreated => MarketEvent::Created {
                item_id: self.uint("itemId")?,
                nft_contract: self.address("nftContract")?,
                token_id: self.uint("tokenId")?,
                seller: self.address("seller")?,
                price: Amount(self.uint("price")?),
            },
            EventKind::MarketItemSold => MarketEvent::Sold {
                item_id: self.uint("itemId")?,
                buyer: self.address("buyer")?,
                price: Amount(self.uint("price")?),
            },
            EventKind::MarketItemCanceled => MarketEvent::Canceled {
                item_id: self.uint("itemId")?,
            },
        })
    }
}

/// Typed view of a marketplace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    Created {
        item_id: U256,
        nft_contract: String,
        token_id: U256,
        seller: String,
        price: Amount,
    },
    Sold {
        item_id: U256,
        buyer: String,
        price: Amount,
    },
    Canceled {
        item_id: U256,
    },
}

impl MarketEvent {
    pub fn item_id(&self) -> U256 {
        match self {
            Self::Created { item_id, .. }
            | Self::Sold { item_id, .. }
            | Self::Canceled { item_id } => *item_id,
        }
    }
}

// ─── ListingRecord ────────────────────────────────────────────────────────────

/// Lifecycle of a listing. Transitions only go `active → sold | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Sold,
    Cancelled,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Sold => "sold",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn can_transition_to(&self, next: ListingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Sold) | (Self::Active, Self::Cancelled)
        )
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "sold" => Ok(Self::Sold),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown listing status '{other}'")),
        }
    }
}

/// Off-chain projection of a marketplace item, keyed by `item_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub item_id: U256,
    pub nft_contract: String,
    pub token_id: U256,
    pub seller: String,
    /// Set when the listing is sold.
    pub buyer: Option<String>,
    pub price: Amount,
    pub status: ListingStatus,
    pub listed_at: DateTime<Utc>,
    pub sold_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Creation transaction; unknown for listings accepted through the
    /// verified write path.
    pub tx_hash: Option<String>,
    pub sale_tx_hash: Option<String>,
}

impl ListingRecord {
    /// A fresh `active` listing.
    pub fn new_active(
        item_id: U256,
        nft_contract: &str,
        token_id: U256,
        seller: &str,
        price: Amount,
        listed_at: DateTime<Utc>,
        tx_hash: Option<String>,
    ) -> Self {
        Self {
            item_id,
            nft_contract: normalize_address(nft_contract),
            token_id,
            seller: normalize_address(seller),
            buyer: None,
            price,
            status: ListingStatus::Active,
            listed_at,
            sold_at: None,
            cancelled_at: None,
            tx_hash,
            sale_tx_hash: None,
        }
    }

    /// Apply the `active → sold` transition in place.
    pub fn mark_sold(&mut self, sale: &SaleUpdate) -> bool {
        if !self.status.can_transition_to(ListingStatus::Sold) {
            return false;
        }
        self.status = ListingStatus::Sold;
        self.buyer = Some(normalize_address(&sale.buyer));
        self.sold_at = Some(sale.sold_at);
        self.sale_tx_hash = Some(sale.tx.key.tx_hash.clone());
        true
    }

    /// Apply the `active → cancelled` transition in place.
    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(ListingStatus::Cancelled) {
            return false;
        }
        self.status = ListingStatus::Cancelled;
        self.cancelled_at = Some(at);
        true
    }
}

/// Everything needed to move a listing to `sold` and append its `sale`
/// transaction in one atomic step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleUpdate {
    pub item_id: U256,
    pub buyer: String,
    pub sold_at: DateTime<Utc>,
    pub tx: TransactionRecord,
}

// ─── TransactionRecord ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Mint,
    List,
    Sale,
    Cancel,
    Transfer,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::List => "list",
            Self::Sale => "sale",
            Self::Cancel => "cancel",
            Self::Transfer => "transfer",
        }
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mint" => Ok(Self::Mint),
            "list" => Ok(Self::List),
            "sale" => Ok(Self::Sale),
            "cancel" => Ok(Self::Cancel),
            "transfer" => Ok(Self::Transfer),
            other => Err(format!("unknown transaction type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Only `pending → confirmed | failed` is allowed.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed) | (Self::Pending, Self::Failed)
        )
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transaction status '{other}'")),
        }
    }
}

/// Natural key of a transaction record.
///
/// Chain-sourced records carry the log index; records synthesized by the
/// verified write path have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxKey {
    pub tx_hash: String,
    pub log_index: Option<u32>,
}

impl TxKey {
    pub fn chain(tx_hash: &str, log_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.to_ascii_lowercase(),
            log_index: Some(log_index),
        }
    }

    pub fn synthesized(tx_hash: &str) -> Self {
        Self {
            tx_hash: tx_hash.to_ascii_lowercase(),
            log_index: None,
        }
    }

    /// Log index as stored in SQL (`-1` for synthesized keys).
    pub fn log_index_column(&self) -> i64 {
        self.log_index.map(i64::from).unwrap_or(-1)
    }

    pub fn from_columns(tx_hash: String, log_index: i64) -> Self {
        Self {
            tx_hash,
            log_index: u32::try_from(log_index).ok(),
        }
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.log_index {
            Some(idx) => write!(f, "{}:{}", self.tx_hash, idx),
            None => write!(f, "{}:synthesized", self.tx_hash),
        }
    }
}

/// Append-only history entry for a marketplace action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub key: TxKey,
    pub tx_type: TxType,
    pub item_id: Option<U256>,
    pub nft_contract: Option<String>,
    pub token_id: Option<U256>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub value: Amount,
    pub platform_fee: Amount,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub status: TxStatus,
    pub recorded_at: DateTime<Utc>,
}

// ─── SyncState ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Active,
    Paused,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// Catch-up checkpoint, one per watched contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub contract_address: String,
    /// Highest block whose logs have been fully reconciled.
    pub last_synced_block: u64,
    pub last_synced_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub last_error: Option<String>,
}

// ─── Anomaly ──────────────────────────────────────────────────────────────────

/// An event that could not be reconciled after bounded retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    /// `tx_hash:log_index` of the offending event.
    pub event_key: String,
    pub kind: EventKind,
    pub item_id: Option<U256>,
    pub reason: String,
    pub attempts: u32,
    pub event: ChainEvent,
    pub first_seen: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// An event parked in the reconciler's retry queue. Persisted so a restart
/// resumes the retries instead of losing the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredEvent {
    pub event: ChainEvent,
    /// Failed attempts so far.
    pub attempts: u32,
    pub reason: String,
    pub first_seen: DateTime<Utc>,
}

impl DeferredEvent {
    pub fn key(&self) -> TxKey {
        self.event.key()
    }
}

// ─── MarketStats ──────────────────────────────────────────────────────────────

/// Aggregates for one NFT contract, recomputed from the full record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStats {
    pub nft_contract: String,
    pub total_listings: u64,
    pub active_listings: u64,
    pub sold_listings: u64,
    pub cancelled_listings: u64,
    /// Lowest active price.
    pub floor_price: Option<Amount>,
    /// Highest active price.
    pub ceiling_price: Option<Amount>,
    pub average_price: Option<Amount>,
    /// Sum of confirmed sale values.
    pub total_volume: Amount,
    pub total_sales: u64,
    /// Distinct sellers with an active listing.
    pub unique_sellers: u64,
    /// Distinct buyers across confirmed sales.
    pub unique_buyers: u64,
    pub computed_at: DateTime<Utc>,
}

impl MarketStats {
    /// Derive the aggregates for `nft_contract` from its listings and
    /// transactions. Records for other contracts are ignored.
    pub fn compute(
        nft_contract: &str,
        listings: &[ListingRecord],
        transactions: &[TransactionRecord],
    ) -> Self {
        let contract = normalize_address(nft_contract);
        let mut stats = MarketStats {
            nft_contract: contract.clone(),
            total_listings: 0,
            active_listings: 0,
            sold_listings: 0,
            cancelled_listings: 0,
            floor_price: None,
            ceiling_price: None,
            average_price: None,
            total_volume: Amount::ZERO,
            total_sales: 0,
            unique_sellers: 0,
            unique_buyers: 0,
            computed_at: Utc::now(),
        };

        let mut sellers = BTreeSet::new();
        let mut active_sum = U256::ZERO;
        for listing in listings.iter().filter(|l| l.nft_contract == contract) {
            stats.total_listings += 1;
            match listing.status {
                ListingStatus::Active => {
                    stats.active_listings += 1;
                    sellers.insert(listing.seller.as_str());
                    active_sum = active_sum.saturating_add(listing.price.0);
                    stats.floor_price = Some(match stats.floor_price {
                        Some(f) => f.min(listing.price),
                        None => listing.price,
                    });
                    stats.ceiling_price = Some(match stats.ceiling_price {
                        Some(c) => c.max(listing.price),
                        None => listing.price,
                    });
                }
                ListingStatus::Sold => stats.sold_listings += 1,
                ListingStatus::Cancelled => stats.cancelled_listings += 1,
            }
        }
        if stats.active_listings > 0 {
            stats.average_price = Some(Amount(active_sum / U256::from(stats.active_listings)));
        }
        stats.unique_sellers = sellers.len() as u64;

        let mut buyers = BTreeSet::new();
        let mut volume = U256::ZERO;
        for tx in transactions.iter().filter(|t| {
            t.tx_type == TxType::Sale
                && t.status == TxStatus::Confirmed
                && t.nft_contract.as_deref() == Some(contract.as_str())
        }) {
            stats.total_sales += 1;
            volume = volume.saturating_add(tx.value.0);
            if let Some(buyer) = tx.to_address.as_deref() {
                buyers.insert(buyer);
            }
        }
        stats.total_volume = Amount(volume);
        stats.unique_buyers = buyers.len() as u64;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NFT: &str = "0x00000000000000000000000000000000000000aa";

    fn listing(id: u64, seller: &str, price: u64, status: ListingStatus) -> ListingRecord {
        let mut l = ListingRecord::new_active(
            U256::from(id),
            NFT,
            U256::from(id),
            seller,
            Amount::from_u64(price),
            Utc::now(),
            None,
        );
        l.status = status;
        l
    }

    fn sale(hash: &str, buyer: &str, value: u64, status: TxStatus) -> TransactionRecord {
        TransactionRecord {
            key: TxKey::chain(hash, 0),
            tx_type: TxType::Sale,
            item_id: Some(U256::from(1)),
            nft_contract: Some(NFT.to_string()),
            token_id: None,
            from_address: None,
            to_address: Some(buyer.to_string()),
            value: Amount::from_u64(value),
            platform_fee: Amount::ZERO,
            block_number: Some(1),
            block_timestamp: None,
            status,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn amount_sort_key_orders_numerically() {
        let small = Amount::from_u64(9);
        let large = Amount::from_u64(100);
        assert_eq!(small.sort_key().len(), AMOUNT_SORT_WIDTH);
        assert!(small.sort_key() < large.sort_key());
        assert_eq!(Amount(U256::MAX).sort_key().len(), AMOUNT_SORT_WIDTH);
    }

    #[test]
    fn amount_serializes_as_decimal_string() {
        let json = serde_json::to_string(&Amount::from_u64(100)).unwrap();
        assert_eq!(json, "\"100\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Amount::from_u64(100));
        assert!("12x".parse::<Amount>().is_err());
    }

    #[test]
    fn listing_status_is_monotonic() {
        use ListingStatus::*;
        assert!(Active.can_transition_to(Sold));
        assert!(Active.can_transition_to(Cancelled));
        for terminal in [Sold, Cancelled] {
            for next in [Active, Sold, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn cancelled_listing_cannot_be_sold() {
        let mut l = listing(1, "0x01", 10, ListingStatus::Active);
        assert!(l.mark_cancelled(Utc::now()));
        assert!(!l.mark_cancelled(Utc::now()));
        let update = SaleUpdate {
            item_id: l.item_id,
            buyer: "0xbb".into(),
            sold_at: Utc::now(),
            tx: sale("0xabc", "0xbb", 10, TxStatus::Confirmed),
        };
        assert!(!l.mark_sold(&update));
        assert_eq!(l.status, ListingStatus::Cancelled);
        assert!(l.buyer.is_none());
    }

    #[test]
    fn tx_status_only_leaves_pending() {
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Confirmed));
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Failed));
        assert!(!TxStatus::Confirmed.can_transition_to(TxStatus::Failed));
        assert!(!TxStatus::Failed.can_transition_to(TxStatus::Pending));
    }

    #[test]
    fn tx_key_columns() {
        let k = TxKey::synthesized("0xABC");
        assert_eq!(k.log_index_column(), -1);
        assert_eq!(TxKey::from_columns("0xabc".into(), -1), k);
        assert_eq!(TxKey::chain("0xabc", 3).to_string(), "0xabc:3");
    }

    #[test]
    fn normalize_address_lowercases() {
        assert_eq!(normalize_address("0xAbC"), "0xabc");
        assert_eq!(normalize_address("AbC"), "0xabc");
    }

    #[test]
    fn stats_from_records() {
        let listings = vec![
            listing(1, "0x01", 300, ListingStatus::Active),
            listing(2, "0x02", 100, ListingStatus::Active),
            listing(3, "0x01", 200, ListingStatus::Active),
            listing(4, "0x03", 50, ListingStatus::Sold),
            listing(5, "0x03", 70, ListingStatus::Cancelled),
        ];
        let txs = vec![
            sale("0x1", "0xb1", 50, TxStatus::Confirmed),
            sale("0x2", "0xb1", 25, TxStatus::Confirmed),
            sale("0x3", "0xb2", 999, TxStatus::Pending),
        ];
        let s = MarketStats::compute(NFT, &listings, &txs);
        assert_eq!(s.total_listings, 5);
        assert_eq!(s.active_listings, 3);
        assert_eq!(s.sold_listings, 1);
        assert_eq!(s.cancelled_listings, 1);
        assert_eq!(s.floor_price, Some(Amount::from_u64(100)));
        assert_eq!(s.ceiling_price, Some(Amount::from_u64(300)));
        assert_eq!(s.average_price, Some(Amount::from_u64(200)));
        assert_eq!(s.unique_sellers, 2);
        assert_eq!(s.total_sales, 2);
        assert_eq!(s.total_volume, Amount::from_u64(75));
        assert_eq!(s.unique_buyers, 1);
    }

    #[test]
    fn stats_for_empty_contract() {
        let s = MarketStats::compute(NFT, &[], &[]);
        assert_eq!(s.total_listings, 0);
        assert!(s.floor_price.is_none());
        assert!(s.average_price.is_none());
        assert!(s.total_volume.is_zero());
    }
}
