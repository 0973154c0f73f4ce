//! MarketSync CLI: runs the sync engine and exposes operator commands.
//!
//! # Commands
//! ```text
//! marketsync run
//! marketsync status
//! marketsync rewind    <block>
//! marketsync pause
//! marketsync resume
//! marketsync anomalies [--limit N]
//! marketsync stats     <nft-contract>
//! marketsync verify    <item-id>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use marketsync_core::{ChainGateway, ProjectionStore, SyncConfig, SyncStateManager, SyncStateStore};
use marketsync_evm::{JsonRpcGateway, OnChainVerifier, SyncEngineBuilder};
use marketsync_storage::{PostgresStore, SqliteStore};

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "marketsync",
    about = "NFT marketplace chain-to-database synchronizer",
    long_about = "
MarketSync keeps a database projection of an NFT marketplace contract in step
with the chain: live log subscriptions, periodic catch-up over eth_getLogs and
on-chain verification of externally submitted listings and sales.

ENVIRONMENT VARIABLES:
  ETHEREUM_RPC          HTTP JSON-RPC endpoint
  ETHEREUM_WS           WebSocket JSON-RPC endpoint (required for `run`)
  MARKETPLACE_ADDRESS   Marketplace contract address
  DATABASE_URL          sqlite path or postgres:// URL
  START_BLOCK           First block to sync on a fresh database
  BLOCK_CONFIRMATIONS   Blocks behind head treated as final
  SYNC_BATCH_SIZE       Blocks per eth_getLogs window
  LOG_LEVEL             trace | debug | info | warn | error
  LOG_FORMAT            text | json
",
    version
)]
struct Cli {
    /// HTTP JSON-RPC endpoint
    #[arg(long, env = "ETHEREUM_RPC", global = true, default_value = "http://127.0.0.1:8545")]
    rpc: String,

    /// WebSocket JSON-RPC endpoint
    #[arg(long, env = "ETHEREUM_WS", global = true)]
    ws: Option<String>,

    /// Marketplace contract address (overrides the config file)
    #[arg(long, env = "MARKETPLACE_ADDRESS", global = true)]
    marketplace: Option<String>,

    /// sqlite file path or postgres:// URL
    #[arg(long, env = "DATABASE_URL", global = true, default_value = "./marketsync.db")]
    database_url: String,

    /// JSON file holding a full SyncConfig; flags override its fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "START_BLOCK", global = true)]
    start_block: Option<u64>,

    #[arg(long, env = "BLOCK_CONFIRMATIONS", global = true)]
    confirmations: Option<u64>,

    #[arg(long, env = "SYNC_BATCH_SIZE", global = true)]
    batch_size: Option<u64>,

    #[arg(long, env = "LOG_LEVEL", global = true, default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run subscriptions, catch-up and the retry queue until Ctrl-C
    Run,

    /// Show the persisted sync state
    Status,

    /// Move the sync cursor back so catch-up re-reads from `block + 1`
    Rewind {
        /// New last synced block
        block: u64,
    },

    /// Stop catch-up from advancing the cursor
    Pause,

    /// Resume a paused or errored sync
    Resume,

    /// List events the reconciler gave up on, newest first
    Anomalies {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show market statistics for one NFT collection
    Stats {
        /// NFT contract address
        nft_contract: String,
    },

    /// Read getMarketItem for one item straight from the chain
    Verify {
        /// Marketplace item id
        item_id: String,
    },
}

/// The opened database, whichever backend the URL selected.
enum Backend {
    Sqlite(Arc<SqliteStore>),
    Postgres(Arc<PostgresStore>),
}

impl Backend {
    async fn open(database_url: &str) -> Result<Self> {
        if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            let store = PostgresStore::connect(database_url)
                .await
                .context("failed to connect to PostgreSQL")?;
            Ok(Self::Postgres(Arc::new(store)))
        } else {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            let store = SqliteStore::open(path)
                .await
                .with_context(|| format!("failed to open SQLite database '{path}'"))?;
            Ok(Self::Sqlite(Arc::new(store)))
        }
    }

    fn projections(&self) -> Arc<dyn ProjectionStore> {
        match self {
            Self::Sqlite(s) => s.clone(),
            Self::Postgres(s) => s.clone(),
        }
    }

    fn sync_states(&self) -> Arc<dyn SyncStateStore> {
        match self {
            Self::Sqlite(s) => s.clone(),
            Self::Postgres(s) => s.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig::new(&cli.log_level, &cli.log_format));

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Run => cmd_run(&cli, config).await,
        Commands::Status => {
            let state = sync_state(&cli, &config).await?.load().await?;
            match state {
                Some(state) => print_json(&state),
                None => {
                    println!("no sync state for {} yet", config.marketplace_address);
                    Ok(())
                }
            }
        }
        Commands::Rewind { block } => {
            let state = sync_state(&cli, &config)
                .await?
                .rewind(*block)
                .await
                .context("rewind failed")?;
            print_json(&state)
        }
        Commands::Pause => print_json(&sync_state(&cli, &config).await?.pause().await?),
        Commands::Resume => print_json(&sync_state(&cli, &config).await?.resume().await?),
        Commands::Anomalies { limit } => {
            let backend = Backend::open(&cli.database_url).await?;
            let anomalies = backend.projections().anomalies(*limit).await?;
            print_json(&anomalies)
        }
        Commands::Stats { nft_contract } => {
            let backend = Backend::open(&cli.database_url).await?;
            match backend.projections().stats(nft_contract).await? {
                Some(stats) => print_json(&stats),
                None => {
                    println!("no statistics for {nft_contract}");
                    Ok(())
                }
            }
        }
        Commands::Verify { item_id } => cmd_verify(&cli, &config, item_id).await,
    }
}

/// Config file first, then flags and environment on top.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            serde_json::from_str::<SyncConfig>(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => SyncConfig::default(),
    };

    if let Some(addr) = &cli.marketplace {
        config.marketplace_address = addr.clone();
    }
    if let Some(block) = cli.start_block {
        config.start_block = block;
    }
    if let Some(depth) = cli.confirmations {
        config.confirmation_depth = depth;
    }
    if let Some(size) = cli.batch_size {
        config.batch_size = size;
    }

    config
        .validate()
        .context("set MARKETPLACE_ADDRESS or pass --marketplace / --config")?;
    Ok(config)
}

fn gateway(cli: &Cli, config: &SyncConfig) -> Result<Arc<dyn ChainGateway>> {
    let gw = JsonRpcGateway::new(cli.rpc.clone(), cli.ws.clone(), config.verify_timeout())
        .context("failed to build JSON-RPC client")?;
    Ok(Arc::new(gw))
}

async fn sync_state(cli: &Cli, config: &SyncConfig) -> Result<SyncStateManager> {
    let backend = Backend::open(&cli.database_url).await?;
    Ok(SyncStateManager::new(
        backend.sync_states(),
        &config.marketplace_address,
    ))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(cli: &Cli, config: SyncConfig) -> Result<()> {
    if cli.ws.is_none() {
        return Err(anyhow!("`run` needs a WebSocket endpoint: set ETHEREUM_WS or pass --ws"));
    }
    let backend = Backend::open(&cli.database_url).await?;
    let engine = SyncEngineBuilder::from_config(config.clone())
        .gateway(gateway(cli, &config)?)
        .projections(backend.projections())
        .sync_states(backend.sync_states())
        .build()
        .context("invalid sync configuration")?;

    let token = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            token.cancel();
        }
    });

    engine.run().await.context("sync engine failed")?;
    Ok(())
}

async fn cmd_verify(cli: &Cli, config: &SyncConfig, item_id: &str) -> Result<()> {
    let item_id = U256::from_str_radix(item_id.trim(), 10)
        .map_err(|e| anyhow!("invalid item id '{item_id}': {e}"))?;
    let verifier = OnChainVerifier::new(
        gateway(cli, config)?,
        &config.marketplace_address,
        config.verify_timeout(),
    );
    let item = verifier
        .fetch_item(item_id)
        .await
        .map_err(|e| anyhow!(e))
        .context("on-chain read failed")?;

    if !item.exists() {
        println!("item {item_id} does not exist on {}", config.marketplace_address);
        return Ok(());
    }
    print_json(&json!({
        "itemId": item.item_id.to_string(),
        "nftContract": item.nft_contract,
        "tokenId": item.token_id.to_string(),
        "seller": item.seller,
        "owner": item.owner,
        "price": item.price.to_string(),
        "sold": item.sold,
        "listedAt": item.listed_at.to_string(),
    }))
}
