//! Sync engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Configuration for one watched marketplace contract.
///
/// Deserializable from JSON; every field except `marketplace_address` has a
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Marketplace contract address (`0x…`).
    pub marketplace_address: String,
    /// Chain label used in logs (e.g. `"ethereum"`).
    #[serde(default = "default_chain")]
    pub chain: String,
    /// First block to reconcile when no SyncState exists yet.
    #[serde(default)]
    pub start_block: u64,
    /// Blocks behind head before a block is eligible for catch-up.
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Block span of one `eth_getLogs` catch-up batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Fixed wait between subscription attempts.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// How often the catch-up job runs.
    #[serde(default = "default_catchup_interval_ms")]
    pub catchup_interval_ms: u64,
    /// Attempts before a deferred event becomes an anomaly.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Minimum wait before a deferred event is retried.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-call timeout for on-chain verification reads.
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Verification attempts before the write path gives up.
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
}

fn default_chain() -> String {
    "ethereum".into()
}
fn default_confirmation_depth() -> u64 {
    12
}
fn default_batch_size() -> u64 {
    1000
}
fn default_reconnect_backoff_ms() -> u64 {
    5_000
}
fn default_catchup_interval_ms() -> u64 {
    30_000
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    2_000
}
fn default_verify_timeout_ms() -> u64 {
    10_000
}
fn default_verify_attempts() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            marketplace_address: String::new(),
            chain: default_chain(),
            start_block: 0,
            confirmation_depth: default_confirmation_depth(),
            batch_size: default_batch_size(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            catchup_interval_ms: default_catchup_interval_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            verify_attempts: default_verify_attempts(),
        }
    }
}

impl SyncConfig {
    pub fn new(marketplace_address: impl Into<String>) -> Self {
        Self {
            marketplace_address: marketplace_address.into(),
            ..Default::default()
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        let addr = self.marketplace_address.trim_start_matches("0x");
        if addr.len() != 40 || !addr.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SyncError::Config(format!(
                "invalid marketplace address '{}'",
                self.marketplace_address
            )));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be > 0".into()));
        }
        if self.retry_max_attempts == 0 || self.verify_attempts == 0 {
            return Err(SyncError::Config("attempt counts must be > 0".into()));
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}
