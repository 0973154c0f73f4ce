//! marketsync-core: domain model and reconciliation engine for MarketSync.
//!
//! # Architecture
//!
//! ```text
//! ChainGateway ──► SubscriptionManager (per topic) ──► EventDecoder ──► Reconciler
//!                                                                          │
//!                  CatchUp job (SyncStateManager) ─────────────────────────┤
//!                                                                          ▼
//!                  CRUD write path ──► OnChainVerifier ──► Reconciler ──► ProjectionStore
//! ```
//!
//! This crate holds the chain-agnostic parts: records, the reconciler with
//! its bounded retry queue, sync-state bookkeeping and aggregate statistics.
//! The EVM specifics (ABI, JSON-RPC, subscriptions) live in `marketsync-evm`,
//! and the SQL backends in `marketsync-storage`.

pub mod config;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod reconciler;
pub mod stats;
pub mod store;
pub mod sync_state;
pub mod types;

pub use config::SyncConfig;
pub use error::{DecodeError, SyncError, TransportError};
pub use gateway::{ChainGateway, LogStream, RawLog, TransactionReceipt};
pub use memory::MemoryStore;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use stats::StatsAggregator;
pub use store::{ProjectionStore, SyncStateStore, TransitionOutcome};
pub use sync_state::SyncStateManager;
pub use types::{
    Amount, Anomaly, ChainEvent, DeferredEvent, EventKind, FieldValue, ListingRecord, ListingStatus,
    MarketEvent, MarketStats, SaleUpdate, SyncState, SyncStatus, TransactionRecord, TxKey, TxStatus, TxType,
};
