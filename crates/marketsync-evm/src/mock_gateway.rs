//! A scriptable in-process [`ChainGateway`] for tests.
//!
//! Subscriptions replay scripted sessions per topic; historical logs are
//! served from an in-memory list; `getMarketItem` answers from a map of
//! [`OnChainItem`]s and receipts from a map keyed by transaction hash.
//! Failures can be injected for each capability.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy_core::dyn_abi::DynSolValue;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use marketsync_core::error::TransportError;
use marketsync_core::gateway::{parse_hex_u64, ChainGateway, LogStream, RawLog, TransactionReceipt};
use marketsync_core::types::{Amount, EventKind};

use crate::abi::{self, OnChainItem};

/// One scripted subscription session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub items: Vec<Result<RawLog, TransportError>>,
    /// Keep the stream open after the scripted items instead of ending it.
    pub stay_open: bool,
}

impl Session {
    /// Deliver `logs`, then drop the connection.
    pub fn dropping(logs: Vec<RawLog>) -> Self {
        Self {
            items: logs.into_iter().map(Ok).collect(),
            stay_open: false,
        }
    }

    /// Deliver `logs` and keep streaming (nothing more arrives).
    pub fn open(logs: Vec<RawLog>) -> Self {
        Self {
            items: logs.into_iter().map(Ok).collect(),
            stay_open: true,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements the live-subscription counter when a stream is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockGateway {
    head: AtomicU64,
    sessions: Mutex<HashMap<String, VecDeque<Session>>>,
    subscribe_failures: Mutex<HashMap<String, u32>>,
    subscribe_calls: Mutex<HashMap<String, u32>>,
    live_streams: Arc<AtomicUsize>,
    history: Mutex<Vec<RawLog>>,
    get_logs_failures: AtomicU32,
    get_logs_ranges: Mutex<Vec<(u64, u64)>>,
    items: Mutex<HashMap<U256, OnChainItem>>,
    call_failures: AtomicU32,
    call_delay: Mutex<Option<Duration>>,
    call_count: AtomicU32,
    receipts: Mutex<HashMap<String, TransactionReceipt>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    /// Queue a session for the next subscription to `kind`.
    pub fn push_session(&self, kind: EventKind, session: Session) {
        lock(&self.sessions)
            .entry(abi::schema(kind).topic0())
            .or_default()
            .push_back(session);
    }

    /// Fail the next `n` subscription attempts for `kind`.
    pub fn fail_subscribes(&self, kind: EventKind, n: u32) {
        lock(&self.subscribe_failures).insert(abi::schema(kind).topic0(), n);
    }

    pub fn subscribe_calls(&self, kind: EventKind) -> u32 {
        lock(&self.subscribe_calls)
            .get(&abi::schema(kind).topic0())
            .copied()
            .unwrap_or(0)
    }

    /// Streams handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    pub fn add_history(&self, logs: impl IntoIterator<Item = RawLog>) {
        lock(&self.history).extend(logs);
    }

    pub fn fail_get_logs(&self, n: u32) {
        self.get_logs_failures.store(n, Ordering::SeqCst);
    }

    /// `(from, to)` of every `get_logs` call so far.
    pub fn get_logs_ranges(&self) -> Vec<(u64, u64)> {
        lock(&self.get_logs_ranges).clone()
    }

    pub fn set_item(&self, item: OnChainItem) {
        lock(&self.items).insert(item.item_id, item);
    }

    pub fn fail_calls(&self, n: u32) {
        self.call_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *lock(&self.call_delay) = Some(delay);
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Serve a successful receipt carrying `logs` for `tx_hash`.
    pub fn set_receipt(&self, tx_hash: &str, logs: Vec<RawLog>) {
        let block_number = logs.first().map(|l| l.block_number.clone());
        self.put_receipt(TransactionReceipt {
            tx_hash: tx_hash.to_ascii_lowercase(),
            block_number,
            status: Some("0x1".into()),
            logs,
        });
    }

    pub fn put_receipt(&self, receipt: TransactionReceipt) {
        lock(&self.receipts).insert(receipt.tx_hash.to_ascii_lowercase(), receipt);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn subscribe_logs(&self, _address: &str, topic0: &str) -> Result<LogStream, TransportError> {
        let topic = topic0.to_ascii_lowercase();
        *lock(&self.subscribe_calls).entry(topic.clone()).or_default() += 1;

        if let Some(n) = lock(&self.subscribe_failures).get_mut(&topic) {
            if *n > 0 {
                *n -= 1;
                return Err(TransportError::WebSocket("mock subscribe failure".into()));
            }
        }

        let session = lock(&self.sessions)
            .get_mut(&topic)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Session::open(Vec::new()));

        self.live_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(self.live_streams.clone());
        let scripted = stream::iter(session.items);
        let stream: LogStream = if session.stay_open {
            Box::pin(scripted.chain(stream::pending()).map(move |item| {
                let _keep = &guard;
                item
            }))
        } else {
            Box::pin(scripted.map(move |item| {
                let _keep = &guard;
                item
            }))
        };
        Ok(stream)
    }

    async fn call(&self, _address: &str, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.call_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.call_failures) {
            return Err(TransportError::Http("mock call failure".into()));
        }
        if input.len() != 36 || input[..4] != abi::selector(abi::GET_MARKET_ITEM) {
            return Err(TransportError::Rpc {
                code: -32000,
                message: "execution reverted".into(),
            });
        }
        let item_id = U256::from_be_slice(&input[4..36]);
        let item = lock(&self.items).get(&item_id).cloned().unwrap_or(OnChainItem {
            item_id: U256::ZERO,
            nft_contract: format!("{:#x}", Address::ZERO),
            token_id: U256::ZERO,
            seller: format!("{:#x}", Address::ZERO),
            owner: format!("{:#x}", Address::ZERO),
            price: Amount::ZERO,
            sold: false,
            listed_at: U256::ZERO,
        });
        abi::encode_market_item(&item).map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn block_number(&self) -> Result<u64, TransportError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        address: &str,
        topics0: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError> {
        lock(&self.get_logs_ranges).push((from, to));
        if Self::take_failure(&self.get_logs_failures) {
            return Err(TransportError::Http("mock getLogs failure".into()));
        }
        Ok(lock(&self.history)
            .iter()
            .filter(|log| log.address.eq_ignore_ascii_case(address))
            .filter(|log| {
                log.topic0()
                    .is_some_and(|t| topics0.iter().any(|want| want.eq_ignore_ascii_case(t)))
            })
            .filter(|log| {
                parse_hex_u64(&log.block_number).is_ok_and(|b| b >= from && b <= to)
            })
            .cloned()
            .collect())
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, TransportError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.call_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.call_failures) {
            return Err(TransportError::Http("mock receipt failure".into()));
        }
        Ok(lock(&self.receipts).get(&tx_hash.to_ascii_lowercase()).cloned())
    }
}

// ─── Log construction ─────────────────────────────────────────────────────────

/// Builds ABI-encoded marketplace logs for one contract.
#[derive(Debug, Clone)]
pub struct LogFactory {
    marketplace: String,
}

impl LogFactory {
    pub fn new(marketplace: &str) -> Self {
        Self {
            marketplace: marketplace.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn created(
        &self,
        item_id: u64,
        nft_contract: &str,
        token_id: u64,
        seller: &str,
        price: u64,
        block: u64,
        tx_hash: &str,
        log_index: u32,
    ) -> RawLog {
        self.log(
            EventKind::MarketItemCreated,
            vec![uint_word(item_id), address_word(nft_contract), uint_word(token_id)],
            DynSolValue::Tuple(vec![
                DynSolValue::Address(to_address(seller)),
                DynSolValue::Uint(U256::from(price), 256),
            ])
            .abi_encode(),
            block,
            tx_hash,
            log_index,
        )
    }

    pub fn sold(
        &self,
        item_id: u64,
        buyer: &str,
        price: u64,
        block: u64,
        tx_hash: &str,
        log_index: u32,
    ) -> RawLog {
        self.log(
            EventKind::MarketItemSold,
            vec![uint_word(item_id), address_word(buyer)],
            DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(price), 256)]).abi_encode(),
            block,
            tx_hash,
            log_index,
        )
    }

    pub fn canceled(&self, item_id: u64, block: u64, tx_hash: &str, log_index: u32) -> RawLog {
        self.log(
            EventKind::MarketItemCanceled,
            vec![uint_word(item_id)],
            Vec::new(),
            block,
            tx_hash,
            log_index,
        )
    }

    fn log(
        &self,
        kind: EventKind,
        indexed: Vec<String>,
        data: Vec<u8>,
        block: u64,
        tx_hash: &str,
        log_index: u32,
    ) -> RawLog {
        let mut topics = vec![abi::schema(kind).topic0()];
        topics.extend(indexed);
        RawLog {
            address: self.marketplace.clone(),
            topics,
            data: format!("0x{}", hex::encode(data)),
            block_number: format!("{block:#x}"),
            block_hash: None,
            tx_hash: tx_hash.to_string(),
            log_index: format!("{log_index:#x}"),
            block_timestamp: None,
            removed: Some(false),
        }
    }
}

fn to_address(s: &str) -> Address {
    abi::parse_address(s).unwrap_or(Address::ZERO)
}

fn uint_word(v: u64) -> String {
    format!("0x{}", hex::encode(DynSolValue::Uint(U256::from(v), 256).abi_encode()))
}

fn address_word(s: &str) -> String {
    format!("0x{}", hex::encode(DynSolValue::Address(to_address(s)).abi_encode()))
}
