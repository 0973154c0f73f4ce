//! # marketsync-evm
//!
//! EVM side of MarketSync: the marketplace ABI, log decoding, live
//! subscriptions, catch-up over `eth_getLogs`, on-chain verification and the
//! verified CRUD write path.
//!
//! ## Implementation notes
//! - Uses `alloy-core` dyn-abi for event and view-call decoding
//! - Topics[0] → keccak256 of the canonical event signature
//! - Topics[1..] → indexed parameters, `data` → the non-indexed tuple
//! - Live logs and historical logs go through the same [`EventDecoder`] and
//!   the same reconciler, so replays are idempotent

pub mod abi;
pub mod catchup;
pub mod decoder;
pub mod engine;
pub mod mock_gateway;
pub mod rpc;
pub mod subscription;
pub mod verifier;
pub mod write_path;

pub use catchup::{CatchUpJob, CatchUpReport, CatchUpRun};
pub use decoder::EventDecoder;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use rpc::JsonRpcGateway;
pub use subscription::{SubscriptionManager, SubscriptionMetrics, SubscriptionState, TopicSubscription};
pub use verifier::{ListingClaim, OnChainVerifier, SaleClaim, Verification, VerifiedSale};
pub use write_path::MarketService;
