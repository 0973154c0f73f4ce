//! `SyncEngine`: wires the live subscriptions, the catch-up job and the
//! reconciler's retry loop together and runs them until shutdown.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marketsync_core::MemoryStore;
//! use marketsync_evm::{mock_gateway::MockGateway, SyncEngineBuilder};
//!
//! # async fn example() -> Result<(), marketsync_core::SyncError> {
//! let engine = SyncEngineBuilder::new("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .start_block(19_000_000)
//!     .confirmation_depth(12)
//!     .gateway(Arc::new(MockGateway::new()))
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//! let shutdown = engine.shutdown_token();
//! tokio::spawn(async move { engine.run().await });
//! shutdown.cancel();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use marketsync_core::config::SyncConfig;
use marketsync_core::error::SyncError;
use marketsync_core::gateway::ChainGateway;
use marketsync_core::reconciler::Reconciler;
use marketsync_core::store::{ProjectionStore, SyncStateStore};
use marketsync_core::sync_state::SyncStateManager;

use crate::catchup::CatchUpJob;
use crate::subscription::SubscriptionManager;
use crate::verifier::OnChainVerifier;
use crate::write_path::MarketService;

const MIN_RETRY_TICK: Duration = Duration::from_millis(10);

/// Fluent builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    gateway: Option<Arc<dyn ChainGateway>>,
    projections: Option<Arc<dyn ProjectionStore>>,
    sync_states: Option<Arc<dyn SyncStateStore>>,
}

impl SyncEngineBuilder {
    pub fn new(marketplace_address: impl Into<String>) -> Self {
        Self::from_config(SyncConfig::new(marketplace_address))
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: SyncConfig) -> Self {
        Self {
            config,
            gateway: None,
            projections: None,
            sync_states: None,
        }
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// First block reconciled when no SyncState exists yet.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Blocks behind head before catch-up treats a block as confirmed.
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Blocks per `eth_getLogs` batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn reconnect_backoff_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_backoff_ms = ms;
        self
    }

    pub fn catchup_interval_ms(mut self, ms: u64) -> Self {
        self.config.catchup_interval_ms = ms;
        self
    }

    /// Retry queue bound and delay between attempts.
    pub fn retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.config.retry_max_attempts = max_attempts;
        self.config.retry_delay_ms = delay_ms;
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn ChainGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Use one backend for both projections and sync state.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ProjectionStore + SyncStateStore + 'static,
    {
        self.projections = Some(store.clone());
        self.sync_states = Some(store);
        self
    }

    pub fn projections(mut self, store: Arc<dyn ProjectionStore>) -> Self {
        self.projections = Some(store);
        self
    }

    pub fn sync_states(mut self, store: Arc<dyn SyncStateStore>) -> Self {
        self.sync_states = Some(store);
        self
    }

    pub fn build(self) -> Result<SyncEngine, SyncError> {
        self.config.validate()?;
        let gateway = self
            .gateway
            .ok_or_else(|| SyncError::Config("a chain gateway is required".into()))?;
        let projections = self
            .projections
            .ok_or_else(|| SyncError::Config("a projection store is required".into()))?;
        let sync_states = self
            .sync_states
            .ok_or_else(|| SyncError::Config("a sync state store is required".into()))?;
        Ok(SyncEngine::new(self.config, gateway, projections, sync_states))
    }
}

/// The running sync service for one marketplace contract.
pub struct SyncEngine {
    config: SyncConfig,
    gateway: Arc<dyn ChainGateway>,
    reconciler: Arc<Reconciler>,
    subscriptions: SubscriptionManager,
    catchup: Arc<CatchUpJob>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    fn new(
        config: SyncConfig,
        gateway: Arc<dyn ChainGateway>,
        projections: Arc<dyn ProjectionStore>,
        sync_states: Arc<dyn SyncStateStore>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            projections,
            config.retry_max_attempts,
            config.retry_delay(),
        ));
        let subscriptions = SubscriptionManager::new(
            &config.marketplace_address,
            gateway.clone(),
            reconciler.clone(),
            config.reconnect_backoff(),
        );
        let catchup = Arc::new(CatchUpJob::new(
            &config,
            gateway.clone(),
            reconciler.clone(),
            sync_states,
        ));
        Self {
            config,
            gateway,
            reconciler,
            subscriptions,
            catchup,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn catchup(&self) -> &CatchUpJob {
        &self.catchup
    }

    pub fn sync_state(&self) -> &SyncStateManager {
        self.catchup.sync_state()
    }

    /// A verified write path sharing this engine's reconciler.
    pub fn market_service(&self) -> MarketService {
        let verifier = OnChainVerifier::new(
            self.gateway.clone(),
            &self.config.marketplace_address,
            self.config.verify_timeout(),
        );
        MarketService::new(
            verifier,
            self.reconciler.clone(),
            self.config.verify_attempts,
            self.config.retry_delay(),
        )
    }

    /// Cancelling this token stops [`SyncEngine::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Reload the persisted retry queue, run every worker until shutdown,
    /// then wait for them to finish their in-flight work.
    pub async fn run(&self) -> Result<(), SyncError> {
        let state = self.sync_state().load_or_init(self.config.start_block).await?;
        let restored = self.reconciler.restore_pending().await?;
        info!(
            contract = %state.contract_address,
            chain = %self.config.chain,
            last_synced_block = state.last_synced_block,
            status = %state.status,
            restored,
            "sync engine starting"
        );

        let mut tasks = JoinSet::new();
        self.subscriptions.spawn(&mut tasks, &self.shutdown);

        let catchup = self.catchup.clone();
        let interval = self.config.catchup_interval();
        let token = self.shutdown.clone();
        tasks.spawn(async move { catchup.run(interval, token).await });

        let reconciler = self.reconciler.clone();
        let tick = self.config.retry_delay().max(MIN_RETRY_TICK);
        let token = self.shutdown.clone();
        tasks.spawn(async move { retry_loop(reconciler, tick, token).await });

        self.shutdown.cancelled().await;
        info!("shutdown requested, waiting for workers");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "sync worker panicked");
            }
        }
        info!(pending = self.reconciler.pending_len(), "sync engine stopped");
        Ok(())
    }
}

async fn retry_loop(reconciler: Arc<Reconciler>, tick: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match reconciler.retry_pending().await {
                Ok(0) => {}
                Ok(resolved) => debug!(resolved, "deferred events resolved"),
                Err(e) => warn!(error = %e, "retry pass failed"),
            },
        }
    }
}
