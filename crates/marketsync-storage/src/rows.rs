//! Row shapes shared by the SQL backends and their conversion into domain
//! records. 256-bit values travel as decimal strings; the backends decide
//! how to store them.

use std::str::FromStr;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};

use marketsync_core::error::SyncError;
use marketsync_core::store::TransitionOutcome;
use marketsync_core::types::{
    Amount, Anomaly, DeferredEvent, ListingRecord, MarketStats, SyncState, TransactionRecord,
    TxKey,
};

pub(crate) fn storage_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn uint(column: &str, raw: &str) -> Result<U256, SyncError> {
    U256::from_str_radix(raw, 10)
        .map_err(|e| SyncError::Storage(format!("column {column}: '{raw}' is not a uint256: {e}")))
}

fn amount(column: &str, raw: &str) -> Result<Amount, SyncError> {
    uint(column, raw).map(Amount)
}

fn parse<T>(column: &str, raw: &str) -> Result<T, SyncError>
where
    T: FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e| SyncError::Storage(format!("column {column}: {e}")))
}

fn block(raw: i64) -> Result<u64, SyncError> {
    u64::try_from(raw).map_err(|_| SyncError::Storage(format!("negative block number {raw}")))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ListingRow {
    pub item_id: String,
    pub nft_contract: String,
    pub token_id: String,
    pub seller: String,
    pub buyer: Option<String>,
    pub price: String,
    pub status: String,
    pub listed_at: DateTime<Utc>,
    pub sold_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<String>,
    pub sale_tx_hash: Option<String>,
}

impl TryFrom<ListingRow> for ListingRecord {
    type Error = SyncError;

    fn try_from(row: ListingRow) -> Result<Self, SyncError> {
        Ok(ListingRecord {
            item_id: uint("item_id", &row.item_id)?,
            nft_contract: row.nft_contract,
            token_id: uint("token_id", &row.token_id)?,
            seller: row.seller,
            buyer: row.buyer,
            price: amount("price", &row.price)?,
            status: parse("status", &row.status)?,
            listed_at: row.listed_at,
            sold_at: row.sold_at,
            cancelled_at: row.cancelled_at,
            tx_hash: row.tx_hash,
            sale_tx_hash: row.sale_tx_hash,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TransactionRow {
    pub tx_hash: String,
    pub log_index: i64,
    pub tx_type: String,
    pub item_id: Option<String>,
    pub nft_contract: Option<String>,
    pub token_id: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub value: String,
    pub platform_fee: String,
    pub block_number: Option<i64>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = SyncError;

    fn try_from(row: TransactionRow) -> Result<Self, SyncError> {
        Ok(TransactionRecord {
            key: TxKey::from_columns(row.tx_hash, row.log_index),
            tx_type: parse("tx_type", &row.tx_type)?,
            item_id: row.item_id.as_deref().map(|s| uint("item_id", s)).transpose()?,
            nft_contract: row.nft_contract,
            token_id: row.token_id.as_deref().map(|s| uint("token_id", s)).transpose()?,
            from_address: row.from_address,
            to_address: row.to_address,
            value: amount("value", &row.value)?,
            platform_fee: amount("platform_fee", &row.platform_fee)?,
            block_number: row.block_number.map(block).transpose()?,
            block_timestamp: row.block_timestamp,
            status: parse("status", &row.status)?,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SyncStateRow {
    pub contract_address: String,
    pub last_synced_block: i64,
    pub last_synced_at: DateTime<Utc>,
    pub status: String,
    pub last_error: Option<String>,
}

impl TryFrom<SyncStateRow> for SyncState {
    type Error = SyncError;

    fn try_from(row: SyncStateRow) -> Result<Self, SyncError> {
        Ok(SyncState {
            contract_address: row.contract_address,
            last_synced_block: block(row.last_synced_block)?,
            last_synced_at: row.last_synced_at,
            status: parse("status", &row.status)?,
            last_error: row.last_error,
        })
    }
}

// Stats, anomalies and deferred events are stored whole as JSON next to
// their key columns.

pub(crate) fn stats_to_json(stats: &MarketStats) -> Result<String, SyncError> {
    serde_json::to_string(stats).map_err(storage_err)
}

pub(crate) fn stats_from_json(raw: &str) -> Result<MarketStats, SyncError> {
    serde_json::from_str(raw).map_err(storage_err)
}

pub(crate) fn anomaly_to_json(anomaly: &Anomaly) -> Result<String, SyncError> {
    serde_json::to_string(anomaly).map_err(storage_err)
}

pub(crate) fn anomaly_from_json(raw: &str) -> Result<Anomaly, SyncError> {
    serde_json::from_str(raw).map_err(storage_err)
}

pub(crate) fn deferred_to_json(deferred: &DeferredEvent) -> Result<String, SyncError> {
    serde_json::to_string(deferred).map_err(storage_err)
}

pub(crate) fn deferred_from_json(raw: &str) -> Result<DeferredEvent, SyncError> {
    serde_json::from_str(raw).map_err(storage_err)
}

/// SQL column value for optional 256-bit ids.
pub(crate) fn opt_uint(v: Option<U256>) -> Option<String> {
    v.map(|v| v.to_string())
}

/// Block numbers are stored as signed 64-bit integers.
pub(crate) fn block_column(v: u64) -> Result<i64, SyncError> {
    i64::try_from(v).map_err(|_| SyncError::Storage(format!("block number {v} out of range")))
}

/// Outcome of a conditional update given whether it hit a row and the
/// listing as read back afterwards.
pub(crate) fn transition(applied: bool, current: Option<ListingRecord>) -> TransitionOutcome {
    match current {
        None => TransitionOutcome::Missing,
        Some(listing) if applied => TransitionOutcome::Applied(listing),
        Some(listing) => TransitionOutcome::Terminal(listing),
    }
}
