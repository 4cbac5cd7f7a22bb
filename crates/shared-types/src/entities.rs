//! # Core Domain Entities
//!
//! Block headers and contract logs as they are handed out to subscribers.
//!
//! ## Clusters
//!
//! - **Primitives**: `Address`, `Hash`, `Bytes`, `BlockNumber`
//! - **Chain**: `Header`, `Log`

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// Re-export fixed-size hashes from primitive-types for use across all crates
pub use primitive_types::{H160 as Address, H256 as Hash};

/// Block number type.
pub type BlockNumber = u64;

// =============================================================================
// PRIMITIVES
// =============================================================================

/// Opaque byte payload with `0x` hex serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn new() -> Self {
        Bytes(Vec::new())
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Bytes(slice.to_vec())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(v: &[u8]) -> Self {
        Bytes(v.to_vec())
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl Serialize for Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s)
            .map(Bytes)
            .map_err(|_| de::Error::custom("invalid hex bytes"))
    }
}

// =============================================================================
// CHAIN
// =============================================================================

/// Block header as delivered to `newHeads` subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Hash of this header.
    pub hash: Hash,
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Block height.
    pub number: BlockNumber,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    /// Block proposer.
    pub miner: Address,
    /// State root after applying the block.
    pub state_root: Hash,
    /// Root of the transaction trie.
    pub transactions_root: Hash,
    /// Root of the receipt trie.
    pub receipts_root: Hash,
    /// Gas limit of the block.
    pub gas_limit: u64,
    /// Gas consumed by the block.
    pub gas_used: u64,
    /// EIP-1559 base fee, absent before the fee market is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<u64>,
}

/// A contract log entry with its inclusion metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Contract that emitted the log.
    pub address: Address,
    /// Indexed topics (at most four).
    pub topics: Vec<Hash>,
    /// Non-indexed payload.
    pub data: Bytes,
    /// Height of the including block.
    pub block_number: BlockNumber,
    /// Hash of the including block.
    pub block_hash: Hash,
    /// Hash of the emitting transaction.
    pub transaction_hash: Hash,
    /// Position of the transaction in the block.
    pub transaction_index: u64,
    /// Position of the log in the block.
    pub log_index: u64,
    /// True if the log was reverted by a chain reorganization.
    #[serde(default)]
    pub removed: bool,
}
