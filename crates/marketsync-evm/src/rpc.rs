//! JSON-RPC [`ChainGateway`] over HTTP (`reqwest`) and WebSocket
//! (`tokio-tungstenite`).
//!
//! `eth_call`, `eth_blockNumber`, `eth_getLogs` and
//! `eth_getTransactionReceipt` go over HTTP.
//! `eth_subscribe("logs")` opens a dedicated WebSocket per subscription; a
//! pump task forwards notifications into a channel and sends
//! `eth_unsubscribe` once the returned stream is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use marketsync_core::error::TransportError;
use marketsync_core::gateway::{parse_hex_u64, ChainGateway, LogStream, RawLog, TransactionReceipt};

// ─── JSON-RPC envelope ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(err) = self.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ─── Gateway ──────────────────────────────────────────────────────────────────

const SUBSCRIPTION_BUFFER: usize = 512;

pub struct JsonRpcGateway {
    http_url: String,
    ws_url: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcGateway {
    /// `ws_url` is required for live subscriptions; catch-up and
    /// verification only need HTTP.
    pub fn new(
        http_url: impl Into<String>,
        ws_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            http_url: http_url.into(),
            ws_url,
            http,
            request_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one JSON-RPC request over HTTP and return its `result`.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let resp = self
            .http
            .post(&self.http_url)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        ms: self.request_timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| TransportError::Deserialization(e.to_string()))?
            .into_result()
    }
}

#[async_trait]
impl ChainGateway for JsonRpcGateway {
    async fn subscribe_logs(&self, address: &str, topic0: &str) -> Result<LogStream, TransportError> {
        let ws_url = self
            .ws_url
            .as_deref()
            .ok_or_else(|| TransportError::Other("no WebSocket endpoint configured".into()))?;

        let (ws, _) = connect_async(ws_url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let req = JsonRpcRequest::new(
            self.next_id(),
            "eth_subscribe",
            json!(["logs", { "address": address, "topics": [topic0] }]),
        );
        let request_text =
            serde_json::to_string(&req).map_err(|e| TransportError::Deserialization(e.to_string()))?;
        write
            .send(Message::Text(request_text))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        // Wait for the subscription id.
        let subscription_id = loop {
            let msg = tokio::time::timeout(self.request_timeout, read.next())
                .await
                .map_err(|_| TransportError::Timeout {
                    ms: self.request_timeout.as_millis() as u64,
                })?;
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let resp: JsonRpcResponse = serde_json::from_str(&text)
                        .map_err(|e| TransportError::Deserialization(e.to_string()))?;
                    if resp.id.as_ref().and_then(Value::as_u64) != Some(req.id) {
                        continue;
                    }
                    let result = resp.into_result()?;
                    break result
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| TransportError::Deserialization("subscription id is not a string".into()))?;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::SubscriptionClosed("closed before subscribing".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        };
        info!(topic0, subscription = %subscription_id, "log subscription established");

        let (tx, mut rx) = mpsc::channel::<Result<RawLog, TransportError>>(SUBSCRIPTION_BUFFER);
        let unsubscribe = JsonRpcRequest::new(self.next_id(), "eth_unsubscribe", json!([subscription_id]));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        if let Ok(text) = serde_json::to_string(&unsubscribe) {
                            let _ = write.send(Message::Text(text)).await;
                        }
                        let _ = write.close().await;
                        debug!(subscription = %subscription_id, "log subscription released");
                        break;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => match parse_notification(&text, &subscription_id) {
                            Notification::Log(log) => {
                                if tx.send(Ok(log)).await.is_err() {
                                    break;
                                }
                            }
                            Notification::Malformed(reason) => {
                                warn!(subscription = %subscription_id, %reason, "skipping malformed log notification");
                            }
                            Notification::Ignored => {}
                        },
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = tx
                                .send(Err(TransportError::SubscriptionClosed("closed by server".into())))
                                .await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            let _ = tx.send(Err(TransportError::WebSocket(e.to_string()))).await;
                            break;
                        }
                    }
                }
            }
        });

        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(Box::pin(stream))
    }

    async fn call(&self, address: &str, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let result = self
            .request(
                "eth_call",
                json!([{ "to": address, "data": format!("0x{}", hex::encode(input)) }, "latest"]),
            )
            .await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| TransportError::Deserialization("eth_call result is not a string".into()))?;
        hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| TransportError::Deserialization(e.to_string()))
    }

    async fn block_number(&self) -> Result<u64, TransportError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| TransportError::Deserialization("eth_blockNumber result is not a string".into()))?;
        parse_hex_u64(hex_str)
    }

    async fn get_logs(
        &self,
        address: &str,
        topics0: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError> {
        let filter = json!({
            "address": address,
            "fromBlock": format!("{from:#x}"),
            "toBlock": format!("{to:#x}"),
            "topics": [topics0],
        });
        let result = self.request("eth_getLogs", json!([filter])).await?;
        serde_json::from_value(result).map_err(|e| TransportError::Deserialization(e.to_string()))
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, TransportError> {
        let result = self.request("eth_getTransactionReceipt", json!([tx_hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| TransportError::Deserialization(e.to_string()))
    }
}

/// One inbound WebSocket text frame, as seen by a subscription pump.
#[derive(Debug)]
enum Notification {
    Log(RawLog),
    /// A notification for our subscription whose payload is not a log. The
    /// session stays up; catch-up covers the skipped entry.
    Malformed(String),
    /// Not a notification for this subscription.
    Ignored,
}

fn parse_notification(text: &str, subscription_id: &str) -> Notification {
    let Ok(v) = serde_json::from_str::<Value>(text) else {
        return Notification::Ignored;
    };
    if v.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return Notification::Ignored;
    }
    let Some(params) = v.get("params") else {
        return Notification::Ignored;
    };
    if params.get("subscription").and_then(Value::as_str) != Some(subscription_id) {
        return Notification::Ignored;
    }
    match params.get("result") {
        Some(result) => match serde_json::from_value(result.clone()) {
            Ok(log) => Notification::Log(log),
            Err(e) => Notification::Malformed(e.to_string()),
        },
        None => Notification::Malformed("notification without result".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_for_our_subscription() {
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0xsub",
                "result": {
                    "address": "0x1111111111111111111111111111111111111111",
                    "topics": ["0xabc"],
                    "data": "0x",
                    "blockNumber": "0x10",
                    "transactionHash": "0xbeef",
                    "logIndex": "0x0"
                }
            }
        }"#;
        let Notification::Log(log) = parse_notification(text, "0xsub") else {
            panic!("expected a log");
        };
        assert_eq!(log.block_number_u64().unwrap(), 16);
        assert!(matches!(parse_notification(text, "0xother"), Notification::Ignored));
    }

    #[test]
    fn subscription_ack_is_not_a_log() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":"0xsub"}"#;
        assert!(matches!(parse_notification(text, "0xsub"), Notification::Ignored));
    }

    #[test]
    fn malformed_log_payload_is_skipped_not_fatal() {
        let bad = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0xsub", "result": { "address": "0x11", "topics": 7 } }
        }"#;
        assert!(matches!(parse_notification(bad, "0xsub"), Notification::Malformed(_)));

        let empty = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xsub"}}"#;
        assert!(matches!(parse_notification(empty, "0xsub"), Notification::Malformed(_)));
        assert!(matches!(parse_notification("not json", "0xsub"), Notification::Ignored));
    }

    #[tokio::test]
    async fn subscription_survives_a_malformed_notification() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let Some(Ok(Message::Text(req))) = ws.next().await else {
                return;
            };
            let id = serde_json::from_str::<Value>(&req).unwrap()["id"].clone();
            let frames = [
                json!({ "jsonrpc": "2.0", "id": id, "result": "0xsub" }),
                json!({ "jsonrpc": "2.0", "method": "eth_subscription",
                        "params": { "subscription": "0xsub", "result": { "topics": 7 } } }),
                json!({ "jsonrpc": "2.0", "method": "eth_subscription",
                        "params": { "subscription": "0xsub", "result": {
                            "address": "0x1111111111111111111111111111111111111111",
                            "topics": ["0xabc"], "data": "0x", "blockNumber": "0x10",
                            "transactionHash": "0xbeef", "logIndex": "0x0" } } }),
            ];
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            // Hold the socket open until the client hangs up.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let gw = JsonRpcGateway::new(
            "http://127.0.0.1:1",
            Some(format!("ws://{addr}")),
            Duration::from_secs(5),
        )
        .unwrap();
        let mut stream = gw.subscribe_logs("0x11", "0xabc").await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.tx_hash, "0xbeef");
        assert_eq!(first.block_number_u64().unwrap(), 16);
    }

    #[test]
    fn rpc_error_maps_to_transport_error() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#,
        )
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert_eq!(
            err,
            TransportError::Rpc {
                code: -32005,
                message: "query returned more than 10000 results".into()
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn gateway_builds_without_ws() {
        let gw = JsonRpcGateway::new("http://localhost:8545", None, Duration::from_secs(5)).unwrap();
        assert!(gw.ws_url.is_none());
        assert_eq!(gw.next_id(), 1);
        assert_eq!(gw.next_id(), 2);
    }
}
