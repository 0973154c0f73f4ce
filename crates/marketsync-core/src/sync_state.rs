//! SyncState manager: the persisted catch-up checkpoint for one contract.
//!
//! `last_synced_block` only moves forward through [`SyncStateManager::advance`].
//! The single way back is [`SyncStateManager::rewind`], reserved for
//! operator intervention.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::store::SyncStateStore;
use crate::types::{normalize_address, SyncState, SyncStatus};

pub struct SyncStateManager {
    store: Arc<dyn SyncStateStore>,
    contract_address: String,
}

impl SyncStateManager {
    pub fn new(store: Arc<dyn SyncStateStore>, contract_address: &str) -> Self {
        Self {
            store,
            contract_address: normalize_address(contract_address),
        }
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    pub async fn load(&self) -> Result<Option<SyncState>, SyncError> {
        self.store.load(&self.contract_address).await
    }

    /// Load the state, creating it so that the first catch-up batch starts
    /// at `start_block`.
    pub async fn load_or_init(&self, start_block: u64) -> Result<SyncState, SyncError> {
        if let Some(state) = self.load().await? {
            return Ok(state);
        }
        let state = SyncState {
            contract_address: self.contract_address.clone(),
            last_synced_block: start_block.saturating_sub(1),
            last_synced_at: Utc::now(),
            status: SyncStatus::Active,
            last_error: None,
        };
        self.store.save(&state).await?;
        info!(contract = %self.contract_address, start_block, "sync state initialized");
        Ok(state)
    }

    /// Record that every log up to and including `block` is reconciled.
    ///
    /// A `block` at or below the current checkpoint leaves it unchanged.
    pub async fn advance(&self, block: u64) -> Result<SyncState, SyncError> {
        let mut state = self.require().await?;
        if block <= state.last_synced_block {
            return Ok(state);
        }
        state.last_synced_block = block;
        state.last_synced_at = Utc::now();
        if state.status == SyncStatus::Error {
            state.status = SyncStatus::Active;
        }
        state.last_error = None;
        self.store.save(&state).await?;
        Ok(state)
    }

    /// Flag the contract as failing without moving the checkpoint.
    pub async fn mark_error(&self, reason: &str) -> Result<(), SyncError> {
        let mut state = self.require().await?;
        if state.status != SyncStatus::Paused {
            state.status = SyncStatus::Error;
        }
        state.last_error = Some(reason.to_string());
        self.store.save(&state).await
    }

    pub async fn pause(&self) -> Result<SyncState, SyncError> {
        self.set_status(SyncStatus::Paused).await
    }

    pub async fn resume(&self) -> Result<SyncState, SyncError> {
        self.set_status(SyncStatus::Active).await
    }

    /// Operator rewind: move the checkpoint back so the next catch-up run
    /// re-reconciles from `block + 1`. Reconciliation is idempotent, so
    /// replayed blocks produce no duplicates.
    pub async fn rewind(&self, block: u64) -> Result<SyncState, SyncError> {
        let mut state = self.require().await?;
        if block > state.last_synced_block {
            return Err(SyncError::InvalidState(format!(
                "rewind target {block} is ahead of last synced block {}",
                state.last_synced_block
            )));
        }
        warn!(
            contract = %self.contract_address,
            from = state.last_synced_block,
            to = block,
            "operator rewind of sync state"
        );
        state.last_synced_block = block;
        state.last_synced_at = Utc::now();
        self.store.save(&state).await?;
        Ok(state)
    }

    async fn set_status(&self, status: SyncStatus) -> Result<SyncState, SyncError> {
        let mut state = self.require().await?;
        state.status = status;
        if status == SyncStatus::Active {
            state.last_error = None;
        }
        self.store.save(&state).await?;
        info!(contract = %self.contract_address, %status, "sync status changed");
        Ok(state)
    }

    async fn require(&self) -> Result<SyncState, SyncError> {
        self.load().await?.ok_or_else(|| SyncError::NotFound {
            entity: "sync state",
            id: self.contract_address.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn manager() -> SyncStateManager {
        SyncStateManager::new(Arc::new(MemoryStore::new()), "0xABCD")
    }

    #[tokio::test]
    async fn init_starts_before_start_block() {
        let mgr = manager();
        let state = mgr.load_or_init(100).await.unwrap();
        assert_eq!(state.last_synced_block, 99);
        assert_eq!(state.contract_address, "0xabcd");

        // Existing state is kept.
        let again = mgr.load_or_init(500).await.unwrap();
        assert_eq!(again.last_synced_block, 99);
    }

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let mgr = manager();
        mgr.load_or_init(0).await.unwrap();
        assert_eq!(mgr.advance(50).await.unwrap().last_synced_block, 50);
        assert_eq!(mgr.advance(20).await.unwrap().last_synced_block, 50);
        assert_eq!(mgr.load().await.unwrap().unwrap().last_synced_block, 50);
    }

    #[tokio::test]
    async fn error_then_advance_clears() {
        let mgr = manager();
        mgr.load_or_init(0).await.unwrap();
        mgr.mark_error("rpc down").await.unwrap();
        let s = mgr.load().await.unwrap().unwrap();
        assert_eq!(s.status, SyncStatus::Error);
        assert_eq!(s.last_error.as_deref(), Some("rpc down"));

        let s = mgr.advance(10).await.unwrap();
        assert_eq!(s.status, SyncStatus::Active);
        assert!(s.last_error.is_none());
    }

    #[tokio::test]
    async fn pause_survives_errors() {
        let mgr = manager();
        mgr.load_or_init(0).await.unwrap();
        mgr.pause().await.unwrap();
        mgr.mark_error("boom").await.unwrap();
        assert_eq!(mgr.load().await.unwrap().unwrap().status, SyncStatus::Paused);
        assert_eq!(mgr.resume().await.unwrap().status, SyncStatus::Active);
    }

    #[tokio::test]
    async fn rewind_only_goes_back() {
        let mgr = manager();
        mgr.load_or_init(0).await.unwrap();
        mgr.advance(100).await.unwrap();
        assert!(mgr.rewind(200).await.is_err());
        assert_eq!(mgr.rewind(40).await.unwrap().last_synced_block, 40);
    }

    #[tokio::test]
    async fn advance_without_state_fails() {
        let err = manager().advance(1).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }
}
