//! SQLite projection store for MarketSync.
//!
//! Persists listings, transactions, statistics, anomalies, the reconciler's
//! retry queue and sync state to a single SQLite file. Uses `sqlx` with WAL mode. Status transitions run
//! as conditional `UPDATE … WHERE status = 'active'` inside a transaction,
//! together with the history row they produce.
//!
//! # Usage
//! ```rust,no_run
//! use marketsync_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./marketsync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use tracing::debug;

use marketsync_core::error::SyncError;
use marketsync_core::store::{ProjectionStore, SyncStateStore, TransitionOutcome};
use marketsync_core::types::{
    normalize_address, Anomaly, DeferredEvent, ListingRecord, MarketStats, SaleUpdate, SyncState,
    TransactionRecord, TxKey, TxStatus,
};

use crate::rows::{
    anomaly_from_json, anomaly_to_json, block_column, deferred_from_json, deferred_to_json,
    opt_uint, stats_from_json, stats_to_json, storage_err, transition, ListingRow, SyncStateRow,
    TransactionRow,
};

const FILE_POOL_SIZE: u32 = 4;

/// SQLite-backed [`ProjectionStore`] and [`SyncStateStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./marketsync.db"`) or a full
    /// SQLite URL (`"sqlite:./marketsync.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect(&url)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection would see its own empty database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // 256-bit values are decimal TEXT, exact but not numerically
        // ordered; `price_sort` holds the zero-padded form for ORDER BY.
        // log_index is -1 for records synthesized by the write path.
        let statements = [
            "CREATE TABLE IF NOT EXISTS listings (
                item_id      TEXT    PRIMARY KEY,
                nft_contract TEXT    NOT NULL,
                token_id     TEXT    NOT NULL,
                seller       TEXT    NOT NULL,
                buyer        TEXT,
                price        TEXT    NOT NULL,
                price_sort   TEXT    NOT NULL,
                status       TEXT    NOT NULL,
                listed_at    TEXT    NOT NULL,
                sold_at      TEXT,
                cancelled_at TEXT,
                tx_hash      TEXT,
                sale_tx_hash TEXT
            );",
            "CREATE INDEX IF NOT EXISTS idx_listings_contract ON listings (nft_contract, status);",
            "CREATE INDEX IF NOT EXISTS idx_listings_price
                ON listings (nft_contract, status, price_sort);",
            "CREATE TABLE IF NOT EXISTS transactions (
                tx_hash         TEXT    NOT NULL,
                log_index       INTEGER NOT NULL,
                tx_type         TEXT    NOT NULL,
                item_id         TEXT,
                nft_contract    TEXT,
                token_id        TEXT,
                from_address    TEXT,
                to_address      TEXT,
                value           TEXT    NOT NULL,
                platform_fee    TEXT    NOT NULL,
                block_number    INTEGER,
                block_timestamp TEXT,
                status          TEXT    NOT NULL,
                recorded_at     TEXT    NOT NULL,
                PRIMARY KEY (tx_hash, log_index)
            );",
            "CREATE INDEX IF NOT EXISTS idx_transactions_contract ON transactions (nft_contract);",
            "CREATE TABLE IF NOT EXISTS market_stats (
                nft_contract TEXT PRIMARY KEY,
                stats_json   TEXT NOT NULL,
                computed_at  TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS anomalies (
                event_key    TEXT    PRIMARY KEY,
                kind         TEXT    NOT NULL,
                item_id      TEXT,
                reason       TEXT    NOT NULL,
                attempts     INTEGER NOT NULL,
                anomaly_json TEXT    NOT NULL,
                recorded_at  TEXT    NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS deferred_events (
                event_key     TEXT    PRIMARY KEY,
                item_id       TEXT,
                block_number  INTEGER NOT NULL,
                log_index     INTEGER NOT NULL,
                attempts      INTEGER NOT NULL,
                deferred_json TEXT    NOT NULL,
                first_seen    TEXT    NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS sync_state (
                contract_address  TEXT    PRIMARY KEY,
                last_synced_block INTEGER NOT NULL,
                last_synced_at    TEXT    NOT NULL,
                status            TEXT    NOT NULL,
                last_error        TEXT
            );",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }
}

// ─── Query helpers ───────────────────────────────────────────────────────────

async fn fetch_listing<'e, E>(exec: E, item_id: U256) -> Result<Option<ListingRecord>, SyncError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<ListingRow> = sqlx::query_as(
        "SELECT item_id, nft_contract, token_id, seller, buyer, price, status,
                listed_at, sold_at, cancelled_at, tx_hash, sale_tx_hash
         FROM listings WHERE item_id = ?",
    )
    .bind(item_id.to_string())
    .fetch_optional(exec)
    .await
    .map_err(storage_err)?;
    row.map(ListingRecord::try_from).transpose()
}

async fn insert_tx<'e, E>(exec: E, tx: &TransactionRecord) -> Result<bool, SyncError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let block_number = tx.block_number.map(block_column).transpose()?;
    let result = sqlx::query(
        "INSERT INTO transactions
         (tx_hash, log_index, tx_type, item_id, nft_contract, token_id, from_address,
          to_address, value, platform_fee, block_number, block_timestamp, status, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (tx_hash, log_index) DO NOTHING",
    )
    .bind(&tx.key.tx_hash)
    .bind(tx.key.log_index_column())
    .bind(tx.tx_type.as_str())
    .bind(opt_uint(tx.item_id))
    .bind(&tx.nft_contract)
    .bind(opt_uint(tx.token_id))
    .bind(&tx.from_address)
    .bind(&tx.to_address)
    .bind(tx.value.to_string())
    .bind(tx.platform_fee.to_string())
    .bind(block_number)
    .bind(tx.block_timestamp)
    .bind(tx.status.as_str())
    .bind(tx.recorded_at)
    .execute(exec)
    .await
    .map_err(storage_err)?;
    Ok(result.rows_affected() == 1)
}

// ─── ProjectionStore impl ────────────────────────────────────────────────────

#[async_trait]
impl ProjectionStore for SqliteStore {
    async fn insert_listing_if_absent(&self, listing: &ListingRecord) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "INSERT INTO listings
             (item_id, nft_contract, token_id, seller, buyer, price, price_sort, status,
              listed_at, sold_at, cancelled_at, tx_hash, sale_tx_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (item_id) DO NOTHING",
        )
        .bind(listing.item_id.to_string())
        .bind(normalize_address(&listing.nft_contract))
        .bind(listing.token_id.to_string())
        .bind(normalize_address(&listing.seller))
        .bind(&listing.buyer)
        .bind(listing.price.to_string())
        .bind(listing.price.sort_key())
        .bind(listing.status.as_str())
        .bind(listing.listed_at)
        .bind(listing.sold_at)
        .bind(listing.cancelled_at)
        .bind(&listing.tx_hash)
        .bind(&listing.sale_tx_hash)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        let inserted = result.rows_affected() == 1;
        debug!(item_id = %listing.item_id, inserted, "listing upsert");
        Ok(inserted)
    }

    async fn listing(&self, item_id: U256) -> Result<Option<ListingRecord>, SyncError> {
        fetch_listing(&self.pool, item_id).await
    }

    async fn record_sale(&self, sale: &SaleUpdate) -> Result<TransitionOutcome, SyncError> {
        let mut dbtx = self.pool.begin().await.map_err(storage_err)?;

        let applied = sqlx::query(
            "UPDATE listings SET status = 'sold', buyer = ?, sold_at = ?, sale_tx_hash = ?
             WHERE item_id = ? AND status = 'active'",
        )
        .bind(normalize_address(&sale.buyer))
        .bind(sale.sold_at)
        .bind(&sale.tx.key.tx_hash)
        .bind(sale.item_id.to_string())
        .execute(&mut *dbtx)
        .await
        .map_err(storage_err)?
        .rows_affected()
            == 1;
        if applied {
            insert_tx(&mut *dbtx, &sale.tx).await?;
        }
        let current = fetch_listing(&mut *dbtx, sale.item_id).await?;
        dbtx.commit().await.map_err(storage_err)?;

        debug!(item_id = %sale.item_id, applied, "sale transition");
        Ok(transition(applied, current))
    }

    async fn cancel_listing(
        &self,
        item_id: U256,
        at: DateTime<Utc>,
        tx: Option<&TransactionRecord>,
    ) -> Result<TransitionOutcome, SyncError> {
        let mut dbtx = self.pool.begin().await.map_err(storage_err)?;

        let applied = sqlx::query(
            "UPDATE listings SET status = 'cancelled', cancelled_at = ?
             WHERE item_id = ? AND status = 'active'",
        )
        .bind(at)
        .bind(item_id.to_string())
        .execute(&mut *dbtx)
        .await
        .map_err(storage_err)?
        .rows_affected()
            == 1;
        if let (true, Some(tx)) = (applied, tx) {
            insert_tx(&mut *dbtx, tx).await?;
        }
        let current = fetch_listing(&mut *dbtx, item_id).await?;
        dbtx.commit().await.map_err(storage_err)?;

        debug!(%item_id, applied, "cancel transition");
        Ok(transition(applied, current))
    }

    async fn listings_by_contract(
        &self,
        nft_contract: &str,
    ) -> Result<Vec<ListingRecord>, SyncError> {
        let rows: Vec<ListingRow> = sqlx::query_as(
            "SELECT item_id, nft_contract, token_id, seller, buyer, price, status,
                    listed_at, sold_at, cancelled_at, tx_hash, sale_tx_hash
             FROM listings WHERE nft_contract = ?",
        )
        .bind(normalize_address(nft_contract))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut listings = rows
            .into_iter()
            .map(ListingRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        listings.sort_by_key(|l| l.item_id);
        Ok(listings)
    }

    async fn active_listings_by_price(
        &self,
        nft_contract: &str,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, SyncError> {
        let rows: Vec<ListingRow> = sqlx::query_as(
            "SELECT item_id, nft_contract, token_id, seller, buyer, price, status,
                    listed_at, sold_at, cancelled_at, tx_hash, sale_tx_hash
             FROM listings
             WHERE nft_contract = ? AND status = 'active'
             ORDER BY price_sort, item_id
             LIMIT ?",
        )
        .bind(normalize_address(nft_contract))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(ListingRecord::try_from).collect()
    }

    async fn insert_transaction_if_absent(
        &self,
        tx: &TransactionRecord,
    ) -> Result<bool, SyncError> {
        insert_tx(&self.pool, tx).await
    }

    async fn transaction(&self, key: &TxKey) -> Result<Option<TransactionRecord>, SyncError> {
        let row: Option<TransactionRow> = sqlx::query_as(
            "SELECT tx_hash, log_index, tx_type, item_id, nft_contract, token_id, from_address,
                    to_address, value, platform_fee, block_number, block_timestamp, status,
                    recorded_at
             FROM transactions WHERE tx_hash = ? AND log_index = ?",
        )
        .bind(&key.tx_hash)
        .bind(key.log_index_column())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(TransactionRecord::try_from).transpose()
    }

    async fn set_transaction_status(
        &self,
        key: &TxKey,
        status: TxStatus,
    ) -> Result<bool, SyncError> {
        if !TxStatus::Pending.can_transition_to(status) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE transactions SET status = ?
             WHERE tx_hash = ? AND log_index = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(&key.tx_hash)
        .bind(key.log_index_column())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn transactions_by_contract(
        &self,
        nft_contract: &str,
    ) -> Result<Vec<TransactionRecord>, SyncError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            "SELECT tx_hash, log_index, tx_type, item_id, nft_contract, token_id, from_address,
                    to_address, value, platform_fee, block_number, block_timestamp, status,
                    recorded_at
             FROM transactions WHERE nft_contract = ?
             ORDER BY block_number, log_index",
        )
        .bind(normalize_address(nft_contract))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(TransactionRecord::try_from).collect()
    }

    async fn save_stats(&self, stats: &MarketStats) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO market_stats (nft_contract, stats_json, computed_at)
             VALUES (?, ?, ?)
             ON CONFLICT (nft_contract) DO UPDATE
             SET stats_json = excluded.stats_json, computed_at = excluded.computed_at",
        )
        .bind(normalize_address(&stats.nft_contract))
        .bind(stats_to_json(stats)?)
        .bind(stats.computed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn stats(&self, nft_contract: &str) -> Result<Option<MarketStats>, SyncError> {
        let row = sqlx::query("SELECT stats_json FROM market_stats WHERE nft_contract = ?")
            .bind(normalize_address(nft_contract))
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| stats_from_json(&r.get::<String, _>("stats_json")))
            .transpose()
    }

    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO anomalies
             (event_key, kind, item_id, reason, attempts, anomaly_json, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (event_key) DO UPDATE
             SET reason = excluded.reason, attempts = excluded.attempts,
                 anomaly_json = excluded.anomaly_json, recorded_at = excluded.recorded_at",
        )
        .bind(&anomaly.event_key)
        .bind(anomaly.kind.name())
        .bind(opt_uint(anomaly.item_id))
        .bind(&anomaly.reason)
        .bind(i64::from(anomaly.attempts))
        .bind(anomaly_to_json(anomaly)?)
        .bind(anomaly.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn anomalies(&self, limit: usize) -> Result<Vec<Anomaly>, SyncError> {
        let rows = sqlx::query(
            "SELECT anomaly_json FROM anomalies ORDER BY recorded_at DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| anomaly_from_json(&r.get::<String, _>("anomaly_json")))
            .collect()
    }

    async fn save_deferred(&self, deferred: &DeferredEvent) -> Result<(), SyncError> {
        let key = deferred.key();
        sqlx::query(
            "INSERT INTO deferred_events
             (event_key, item_id, block_number, log_index, attempts, deferred_json, first_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (event_key) DO UPDATE
             SET attempts = excluded.attempts, deferred_json = excluded.deferred_json",
        )
        .bind(key.to_string())
        .bind(opt_uint(deferred.event.item_id()))
        .bind(block_column(deferred.event.block_number)?)
        .bind(i64::from(deferred.event.log_index))
        .bind(i64::from(deferred.attempts))
        .bind(deferred_to_json(deferred)?)
        .bind(deferred.first_seen)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_deferred(&self, key: &TxKey) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM deferred_events WHERE event_key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn deferred_events(&self) -> Result<Vec<DeferredEvent>, SyncError> {
        let rows = sqlx::query(
            "SELECT deferred_json FROM deferred_events ORDER BY block_number, log_index",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| deferred_from_json(&r.get::<String, _>("deferred_json")))
            .collect()
    }
}

// ─── SyncStateStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl SyncStateStore for SqliteStore {
    async fn load(&self, contract_address: &str) -> Result<Option<SyncState>, SyncError> {
        let row: Option<SyncStateRow> = sqlx::query_as(
            "SELECT contract_address, last_synced_block, last_synced_at, status, last_error
             FROM sync_state WHERE contract_address = ?",
        )
        .bind(normalize_address(contract_address))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(SyncState::try_from).transpose()
    }

    async fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO sync_state
             (contract_address, last_synced_block, last_synced_at, status, last_error)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (contract_address) DO UPDATE
             SET last_synced_block = excluded.last_synced_block,
                 last_synced_at    = excluded.last_synced_at,
                 status            = excluded.status,
                 last_error        = excluded.last_error",
        )
        .bind(normalize_address(&state.contract_address))
        .bind(block_column(state.last_synced_block)?)
        .bind(state.last_synced_at)
        .bind(state.status.as_str())
        .bind(&state.last_error)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            contract = %state.contract_address,
            block = state.last_synced_block,
            status = %state.status,
            "sync state saved"
        );
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
