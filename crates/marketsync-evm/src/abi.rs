//! Marketplace contract ABI: event schemas, topic hashes and the
//! `getMarketItem` view call.
//!
//! Topic0 of an EVM event is keccak256 of its canonical signature, e.g.
//! `keccak256("MarketItemSold(uint256,address,uint256)")`.

use std::str::FromStr;

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, U256};
use tiny_keccak::{Hasher, Keccak};

use marketsync_core::error::DecodeError;
use marketsync_core::types::{Amount, EventKind};

// ─── Event schemas ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Uint256,
    Address,
    Bool,
}

impl ParamType {
    pub fn sol_name(&self) -> &'static str {
        match self {
            Self::Uint256 => "uint256",
            Self::Address => "address",
            Self::Bool => "bool",
        }
    }

    pub fn dyn_type(&self) -> DynSolType {
        match self {
            Self::Uint256 => DynSolType::Uint(256),
            Self::Address => DynSolType::Address,
            Self::Bool => DynSolType::Bool,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventParam {
    pub name: &'static str,
    pub ty: ParamType,
    pub indexed: bool,
}

const fn param(name: &'static str, ty: ParamType, indexed: bool) -> EventParam {
    EventParam { name, ty, indexed }
}

/// Declared layout of one marketplace event.
#[derive(Debug, Clone, Copy)]
pub struct EventSchema {
    pub kind: EventKind,
    pub params: &'static [EventParam],
}

impl EventSchema {
    /// Canonical signature, e.g. `MarketItemCanceled(uint256)`.
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.params.iter().map(|p| p.ty.sol_name()).collect();
        format!("{}({})", self.kind.name(), types.join(","))
    }

    /// `0x`-prefixed keccak256 of the signature.
    pub fn topic0(&self) -> String {
        format!("0x{}", hex::encode(keccak256(self.signature().as_bytes())))
    }

    /// Indexed parameters, in declared order (topics[1..]).
    pub fn indexed(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| p.indexed)
    }

    /// Non-indexed parameters, in declared order (the data tuple).
    pub fn data(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| !p.indexed)
    }
}

pub const MARKET_ITEM_CREATED: EventSchema = EventSchema {
    kind: EventKind::MarketItemCreated,
    params: &[
        param("itemId", ParamType::Uint256, true),
        param("nftContract", ParamType::Address, true),
        param("tokenId", ParamType::Uint256, true),
        param("seller", ParamType::Address, false),
        param("price", ParamType::Uint256, false),
    ],
};

pub const MARKET_ITEM_SOLD: EventSchema = EventSchema {
    kind: EventKind::MarketItemSold,
    params: &[
        param("itemId", ParamType::Uint256, true),
        param("buyer", ParamType::Address, true),
        param("price", ParamType::Uint256, false),
    ],
};

pub const MARKET_ITEM_CANCELED: EventSchema = EventSchema {
    kind: EventKind::MarketItemCanceled,
    params: &[param("itemId", ParamType::Uint256, true)],
};

pub fn schema(kind: EventKind) -> &'static EventSchema {
    match kind {
        EventKind::MarketItemCreated => &MARKET_ITEM_CREATED,
        EventKind::MarketItemSold => &MARKET_ITEM_SOLD,
        EventKind::MarketItemCanceled => &MARKET_ITEM_CANCELED,
    }
}

/// Topic0 for every watched event, in [`EventKind::ALL`] order.
pub fn all_topics() -> Vec<String> {
    EventKind::ALL.iter().map(|k| schema(*k).topic0()).collect()
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(input);
    hasher.finalize(&mut output);
    output
}

/// First four bytes of keccak256 of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

// ─── getMarketItem ────────────────────────────────────────────────────────────

pub const GET_MARKET_ITEM: &str = "getMarketItem(uint256)";

/// The contract's view of one item, as returned by `getMarketItem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainItem {
    pub item_id: U256,
    pub nft_contract: String,
    pub token_id: U256,
    pub seller: String,
    pub owner: String,
    pub price: Amount,
    pub sold: bool,
    pub listed_at: U256,
}

impl OnChainItem {
    /// The contract returns a zeroed struct for items it never created.
    pub fn exists(&self) -> bool {
        !self.item_id.is_zero()
    }
}

fn market_item_type() -> DynSolType {
    DynSolType::Tuple(vec![
        DynSolType::Uint(256),
        DynSolType::Address,
        DynSolType::Uint(256),
        DynSolType::Address,
        DynSolType::Address,
        DynSolType::Uint(256),
        DynSolType::Bool,
        DynSolType::Uint(256),
    ])
}

pub fn encode_get_market_item(item_id: U256) -> Vec<u8> {
    let mut calldata = selector(GET_MARKET_ITEM).to_vec();
    calldata.extend_from_slice(&DynSolValue::Tuple(vec![DynSolValue::Uint(item_id, 256)]).abi_encode());
    calldata
}

pub fn decode_get_market_item(output: &[u8]) -> Result<OnChainItem, DecodeError> {
    let decoded = market_item_type()
        .abi_decode(output)
        .map_err(|e| DecodeError::AbiDecode {
            event: "getMarketItem",
            reason: e.to_string(),
        })?;
    let DynSolValue::Tuple(values) = decoded else {
        return Err(DecodeError::AbiDecode {
            event: "getMarketItem",
            reason: "expected a tuple".into(),
        });
    };
    let field = |i: usize, name: &str| {
        values
            .get(i)
            .ok_or_else(|| DecodeError::MissingField(name.to_string()))
    };
    Ok(OnChainItem {
        item_id: as_uint(field(0, "itemId")?, "itemId")?,
        nft_contract: as_address(field(1, "nftContract")?, "nftContract")?,
        token_id: as_uint(field(2, "tokenId")?, "tokenId")?,
        seller: as_address(field(3, "seller")?, "seller")?,
        owner: as_address(field(4, "owner")?, "owner")?,
        price: Amount(as_uint(field(5, "price")?, "price")?),
        sold: as_bool(field(6, "sold")?, "sold")?,
        listed_at: as_uint(field(7, "listedAt")?, "listedAt")?,
    })
}

/// ABI-encode an [`OnChainItem`] the way the contract returns it.
pub fn encode_market_item(item: &OnChainItem) -> Result<Vec<u8>, DecodeError> {
    Ok(DynSolValue::Tuple(vec![
        DynSolValue::Uint(item.item_id, 256),
        DynSolValue::Address(parse_address(&item.nft_contract)?),
        DynSolValue::Uint(item.token_id, 256),
        DynSolValue::Address(parse_address(&item.seller)?),
        DynSolValue::Address(parse_address(&item.owner)?),
        DynSolValue::Uint(item.price.0, 256),
        DynSolValue::Bool(item.sold),
        DynSolValue::Uint(item.listed_at, 256),
    ])
    .abi_encode())
}

// ─── Value helpers ────────────────────────────────────────────────────────────

pub fn parse_address(s: &str) -> Result<Address, DecodeError> {
    Address::from_str(s.trim()).map_err(|e| DecodeError::InvalidHex(format!("address '{s}': {e}")))
}

/// Lowercase `0x` form used throughout the projection.
pub fn format_address(addr: &Address) -> String {
    format!("{addr:#x}")
}

pub(crate) fn as_uint(v: &DynSolValue, name: &str) -> Result<U256, DecodeError> {
    match v {
        DynSolValue::Uint(u, _) => Ok(*u),
        _ => Err(DecodeError::FieldType {
            field: name.to_string(),
            expected: "uint",
        }),
    }
}

pub(crate) fn as_address(v: &DynSolValue, name: &str) -> Result<String, DecodeError> {
    match v {
        DynSolValue::Address(a) => Ok(format_address(a)),
        _ => Err(DecodeError::FieldType {
            field: name.to_string(),
            expected: "address",
        }),
    }
}

pub(crate) fn as_bool(v: &DynSolValue, name: &str) -> Result<bool, DecodeError> {
    match v {
        DynSolValue::Bool(b) => Ok(*b),
        _ => Err(DecodeError::FieldType {
            field: name.to_string(),
            expected: "bool",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_known_signatures() {
        assert_eq!(
            hex::encode(keccak256(b"Transfer(address,address,uint256)")),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn canonical_signatures() {
        assert_eq!(
            MARKET_ITEM_CREATED.signature(),
            "MarketItemCreated(uint256,address,uint256,address,uint256)"
        );
        assert_eq!(MARKET_ITEM_SOLD.signature(), "MarketItemSold(uint256,address,uint256)");
        assert_eq!(MARKET_ITEM_CANCELED.signature(), "MarketItemCanceled(uint256)");
        assert_eq!(MARKET_ITEM_CREATED.indexed().count(), 3);
        assert_eq!(MARKET_ITEM_SOLD.data().count(), 1);
    }

    #[test]
    fn topics_are_distinct() {
        let topics = all_topics();
        assert_eq!(topics.len(), 3);
        assert!(topics.iter().all(|t| t.len() == 66 && t.starts_with("0x")));
        assert_ne!(topics[0], topics[1]);
        assert_ne!(topics[1], topics[2]);
    }

    #[test]
    fn get_market_item_calldata() {
        let data = encode_get_market_item(U256::from(7));
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[..4], &selector(GET_MARKET_ITEM));
        assert_eq!(data[35], 7);
    }

    #[test]
    fn market_item_output_decodes() {
        let item = OnChainItem {
            item_id: U256::from(7),
            nft_contract: "0x00000000000000000000000000000000000000aa".into(),
            token_id: U256::from(42),
            seller: "0x00000000000000000000000000000000000000a1".into(),
            owner: "0x0000000000000000000000000000000000000000".into(),
            price: Amount::from_u64(100),
            sold: false,
            listed_at: U256::from(1_700_000_000u64),
        };
        let encoded = encode_market_item(&item).unwrap();
        assert_eq!(encoded.len(), 8 * 32);
        let decoded = decode_get_market_item(&encoded).unwrap();
        assert_eq!(decoded, item);
        assert!(decoded.exists());
    }

    #[test]
    fn truncated_output_is_rejected() {
        let err = decode_get_market_item(&[0u8; 40]).unwrap_err();
        assert!(matches!(err, DecodeError::AbiDecode { .. }));
    }
}
