//! Chain RPC gateway abstraction.
//!
//! The engine needs a resubscribable log stream, read-only contract calls,
//! bounded historical log queries for catch-up, and transaction receipts
//! for verifying externally reported sales. `marketsync-evm` provides the JSON-RPC
//! implementation and a scriptable mock.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// A raw EVM log in its JSON-RPC shape (`eth_getLogs` / `eth_subscribe`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    /// Some nodes include the block timestamp in log objects.
    #[serde(rename = "blockTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, TransportError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, TransportError> {
        let v = parse_hex_u64(&self.log_index)?;
        u32::try_from(v)
            .map_err(|_| TransportError::Deserialization(format!("logIndex out of range: {v}")))
    }

    pub fn block_timestamp_i64(&self) -> Option<i64> {
        self.block_timestamp
            .as_deref()
            .and_then(|ts| parse_hex_u64(ts).ok())
            .and_then(|ts| i64::try_from(ts).ok())
    }

    /// Returns `true` if the node flagged this log as removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// First topic, i.e. the event signature hash.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// A mined transaction's receipt (`eth_getTransactionReceipt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
    /// `0x1` on success, `0x0` on revert. Absent before Byzantium.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<RawLog>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        match self.status.as_deref() {
            Some(status) => parse_hex_u64(status).map(|v| v == 1).unwrap_or(false),
            None => true,
        }
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, TransportError> {
    let body = s.trim_start_matches("0x");
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16)
        .map_err(|e| TransportError::Deserialization(format!("bad hex quantity '{s}': {e}")))
}

/// Live log feed for one subscription session. Ends (or yields an error)
/// when the underlying transport drops; dropping it releases the
/// subscription.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<RawLog, TransportError>> + Send>>;

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Open a log subscription for `address` filtered on one topic0.
    async fn subscribe_logs(&self, address: &str, topic0: &str) -> Result<LogStream, TransportError>;

    /// Read-only contract call (`eth_call` at `latest`).
    async fn call(&self, address: &str, input: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Current head block number.
    async fn block_number(&self) -> Result<u64, TransportError>;

    /// Historical logs for `address` in `[from, to]` whose topic0 is any of
    /// `topics0`.
    async fn get_logs(
        &self,
        address: &str,
        topics0: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError>;

    /// Receipt for `tx_hash`, or `None` if the node knows no mined
    /// transaction with that hash.
    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rpc_log_json() {
        let json = r#"{
            "address": "0x1111111111111111111111111111111111111111",
            "topics": ["0xabc"],
            "data": "0x",
            "blockNumber": "0x1b4",
            "blockHash": "0xdead",
            "transactionHash": "0xbeef",
            "logIndex": "0x3",
            "removed": false
        }"#;
        let log: RawLog = serde_json::from_str(json).unwrap();
        assert_eq!(log.block_number_u64().unwrap(), 436);
        assert_eq!(log.log_index_u32().unwrap(), 3);
        assert_eq!(log.topic0(), Some("0xabc"));
        assert!(log.block_timestamp_i64().is_none());
        assert!(!log.is_removed());
    }

    #[test]
    fn receipt_status() {
        let json = r#"{
            "transactionHash": "0xbeef",
            "blockNumber": "0x10",
            "status": "0x0",
            "logs": []
        }"#;
        let mut receipt: TransactionReceipt = serde_json::from_str(json).unwrap();
        assert!(!receipt.succeeded());
        receipt.status = Some("0x1".into());
        assert!(receipt.succeeded());
        receipt.status = None;
        assert!(receipt.succeeded());
    }

    #[test]
    fn hex_quantity_errors() {
        assert_eq!(parse_hex_u64("0x").unwrap(), 0);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
