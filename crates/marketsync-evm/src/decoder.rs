//! `EventDecoder`: raw marketplace logs to typed [`ChainEvent`]s.
//!
//! Pure: no I/O, no blocking. Indexed parameters come from `topics[1..]`
//! in declared order; the rest are ABI-decoded from `data` as a tuple.

use std::collections::{BTreeMap, HashMap};

use alloy_core::dyn_abi::{DynSolType, DynSolValue};

use marketsync_core::error::DecodeError;
use marketsync_core::gateway::RawLog;
use marketsync_core::types::{normalize_address, ChainEvent, FieldValue};

use crate::abi::{self, EventSchema, ParamType};

#[derive(Debug, Clone)]
pub struct EventDecoder {
    by_topic: HashMap<String, &'static EventSchema>,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDecoder {
    pub fn new() -> Self {
        let by_topic = marketsync_core::types::EventKind::ALL
            .iter()
            .map(|k| {
                let schema = abi::schema(*k);
                (schema.topic0(), schema)
            })
            .collect();
        Self { by_topic }
    }

    /// Schema registered for `topic0`, if any.
    pub fn schema_for(&self, topic0: &str) -> Option<&'static EventSchema> {
        self.by_topic.get(&topic0.to_ascii_lowercase()).copied()
    }

    pub fn decode(&self, log: &RawLog) -> Result<ChainEvent, DecodeError> {
        let topic0 = log.topic0().ok_or(DecodeError::NoTopics)?;
        let schema = self
            .schema_for(topic0)
            .ok_or_else(|| DecodeError::UnknownTopic(topic0.to_string()))?;

        let indexed: Vec<_> = schema.indexed().collect();
        if log.topics.len() != indexed.len() + 1 {
            return Err(DecodeError::TopicCount {
                event: schema.kind.name(),
                expected: indexed.len() + 1,
                actual: log.topics.len(),
            });
        }

        let mut fields = BTreeMap::new();
        for (param, topic) in indexed.iter().zip(log.topics.iter().skip(1)) {
            let bytes = decode_hex(topic)?;
            let value = param
                .ty
                .dyn_type()
                .abi_decode(&bytes)
                .map_err(|e| DecodeError::AbiDecode {
                    event: schema.kind.name(),
                    reason: format!("topic '{}': {e}", param.name),
                })?;
            fields.insert(param.name.to_string(), to_field(param.name, param.ty, &value)?);
        }

        let data_params: Vec<_> = schema.data().collect();
        if !data_params.is_empty() {
            let data = decode_hex(&log.data)?;
            let tuple = DynSolType::Tuple(data_params.iter().map(|p| p.ty.dyn_type()).collect());
            let decoded = tuple.abi_decode(&data).map_err(|e| DecodeError::AbiDecode {
                event: schema.kind.name(),
                reason: e.to_string(),
            })?;
            let values = match decoded {
                DynSolValue::Tuple(vals) => vals,
                other => vec![other],
            };
            for (param, value) in data_params.iter().zip(values.iter()) {
                fields.insert(param.name.to_string(), to_field(param.name, param.ty, value)?);
            }
        }

        let block_number = log
            .block_number_u64()
            .map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        let log_index = log
            .log_index_u32()
            .map_err(|e| DecodeError::InvalidHex(e.to_string()))?;

        Ok(ChainEvent {
            kind: schema.kind,
            contract_address: normalize_address(&log.address),
            block_number,
            log_index,
            tx_hash: log.tx_hash.to_ascii_lowercase(),
            block_timestamp: log.block_timestamp_i64(),
            fields,
        })
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, DecodeError> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(body).map_err(|e| DecodeError::InvalidHex(format!("{s}: {e}")))
}

fn to_field(name: &str, ty: ParamType, value: &DynSolValue) -> Result<FieldValue, DecodeError> {
    Ok(match ty {
        ParamType::Uint256 => FieldValue::Uint(abi::as_uint(value, name)?),
        ParamType::Address => FieldValue::Address(abi::as_address(value, name)?),
        ParamType::Bool => FieldValue::Bool(abi::as_bool(value, name)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gateway::LogFactory;
    use alloy_primitives::U256;
    use marketsync_core::types::{EventKind, MarketEvent};

    const MARKET: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const NFT: &str = "0x00000000000000000000000000000000000000aa";
    const SELLER: &str = "0x00000000000000000000000000000000000000a1";
    const BUYER: &str = "0x00000000000000000000000000000000000000bb";

    #[test]
    fn decodes_created() {
        let log = LogFactory::new(MARKET).created(7, NFT, 42, SELLER, 100, 12, "0xc1", 0);
        let ev = EventDecoder::new().decode(&log).unwrap();
        assert_eq!(ev.kind, EventKind::MarketItemCreated);
        assert_eq!(ev.contract_address, MARKET.to_ascii_lowercase());
        assert_eq!(ev.block_number, 12);
        assert_eq!(
            ev.market_event().unwrap(),
            MarketEvent::Created {
                item_id: U256::from(7),
                nft_contract: NFT.into(),
                token_id: U256::from(42),
                seller: SELLER.into(),
                price: marketsync_core::types::Amount::from_u64(100),
            }
        );
    }

    #[test]
    fn decodes_sold_and_canceled() {
        let f = LogFactory::new(MARKET);
        let dec = EventDecoder::new();
        let sold = dec.decode(&f.sold(7, BUYER, 100, 13, "0xs1", 4)).unwrap();
        assert_eq!(sold.address("buyer").unwrap(), BUYER);
        assert_eq!(sold.log_index, 4);
        let canceled = dec.decode(&f.canceled(7, 14, "0xx1", 0)).unwrap();
        assert_eq!(canceled.kind, EventKind::MarketItemCanceled);
        assert_eq!(canceled.item_id(), Some(U256::from(7)));
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let mut log = LogFactory::new(MARKET).canceled(7, 1, "0x1", 0);
        log.topics[0] = format!("0x{}", "11".repeat(32));
        let err = EventDecoder::new().decode(&log).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTopic(_)));
    }

    #[test]
    fn empty_topics_are_rejected() {
        let mut log = LogFactory::new(MARKET).canceled(7, 1, "0x1", 0);
        log.topics.clear();
        assert_eq!(EventDecoder::new().decode(&log).unwrap_err(), DecodeError::NoTopics);
    }

    #[test]
    fn wrong_topic_count_is_rejected() {
        let mut log = LogFactory::new(MARKET).sold(7, BUYER, 100, 1, "0x1", 0);
        log.topics.pop();
        let err = EventDecoder::new().decode(&log).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::TopicCount { expected: 3, actual: 2, .. }
        ));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut log = LogFactory::new(MARKET).created(7, NFT, 42, SELLER, 100, 1, "0x1", 0);
        log.data = "0x1234".into();
        let err = EventDecoder::new().decode(&log).unwrap_err();
        assert!(matches!(err, DecodeError::AbiDecode { .. }));
    }

    #[test]
    fn bad_hex_is_rejected() {
        let mut log = LogFactory::new(MARKET).canceled(7, 1, "0x1", 0);
        log.topics[1] = "0xzz".into();
        let err = EventDecoder::new().decode(&log).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidHex(_)));
    }
}
