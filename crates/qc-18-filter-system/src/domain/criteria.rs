//! Log filter criteria and matching
//!
//! Standard Ethereum log-filter semantics:
//! - an empty address set matches every emitter
//! - up to four ordered topic slots; an empty slot is a wildcard
//! - OR within a slot, AND across slots
//!
//! # Example
//!
//! ```ignore
//! let criteria = FilterCriteria::new()
//!     .with_address(token)
//!     .with_topic(0, vec![transfer_sig]);
//! assert!(criteria.matches_log(&log));
//! ```

use crate::error::FilterError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use shared_types::{Address, BlockNumber, Hash, Log};
use std::fmt;
use std::str::FromStr;

/// Maximum number of topic slots in a log filter.
pub const MAX_TOPICS: usize = 4;

/// Block tags accepted in filter bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Earliest,
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Earliest => "earliest",
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}

/// A filter bound: explicit height or tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSpec {
    Number(BlockNumber),
    Tag(BlockTag),
}

impl BlockSpec {
    /// Numeric height of the bound, `None` if open-ended.
    fn height(&self) -> Option<BlockNumber> {
        match self {
            BlockSpec::Number(n) => Some(*n),
            BlockSpec::Tag(BlockTag::Earliest) => Some(0),
            BlockSpec::Tag(BlockTag::Latest | BlockTag::Pending) => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, BlockSpec::Tag(BlockTag::Pending))
    }
}

impl fmt::Display for BlockSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSpec::Number(n) => write!(f, "0x{:x}", n),
            BlockSpec::Tag(tag) => f.write_str(tag.as_str()),
        }
    }
}

impl FromStr for BlockSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" => return Ok(BlockSpec::Tag(BlockTag::Earliest)),
            "latest" => return Ok(BlockSpec::Tag(BlockTag::Latest)),
            "pending" => return Ok(BlockSpec::Tag(BlockTag::Pending)),
            _ => {}
        }

        if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex_str, 16)
                .map(BlockSpec::Number)
                .map_err(|_| format!("invalid block number: {}", s))
        } else {
            s.parse::<u64>()
                .map(BlockSpec::Number)
                .map_err(|_| format!("invalid block number: {}", s))
        }
    }
}

impl Serialize for BlockSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(BlockSpec::Number(n)),
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

/// JSON-RPC accepts either a single value or an array.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

fn deserialize_addresses<'de, D>(deserializer: D) -> Result<Vec<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<OneOrMany<Address>>::deserialize(deserializer)?;
    Ok(raw.map(OneOrMany::into_vec).unwrap_or_default())
}

fn deserialize_topics<'de, D>(deserializer: D) -> Result<Vec<Vec<Hash>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Option<OneOrMany<Hash>>>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|slot| slot.map(OneOrMany::into_vec).unwrap_or_default())
        .collect())
}

/// Matching criteria of a log subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    /// Lower block bound (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_block: Option<BlockSpec>,
    /// Upper block bound (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_block: Option<BlockSpec>,
    /// Emitting contracts; empty matches all
    #[serde(
        rename = "address",
        default,
        deserialize_with = "deserialize_addresses",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub addresses: Vec<Address>,
    /// Ordered topic slots; an empty slot is a wildcard
    #[serde(
        default,
        deserialize_with = "deserialize_topics",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub topics: Vec<Vec<Hash>>,
}

impl FilterCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an accepted emitter.
    pub fn with_address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    /// Replace the accepted emitters.
    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Set the accepted values of one topic slot, widening earlier slots to wildcards.
    ///
    /// Positions past [`MAX_TOPICS`] collapse onto the first slot out of
    /// range, which [`validate`](Self::validate) rejects.
    pub fn with_topic(mut self, position: usize, values: Vec<Hash>) -> Self {
        let position = position.min(MAX_TOPICS);
        if self.topics.len() <= position {
            self.topics.resize(position + 1, Vec::new());
        }
        self.topics[position] = values;
        self
    }

    /// Replace all topic slots.
    pub fn with_topics(mut self, topics: Vec<Vec<Hash>>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_from_block(mut self, from: BlockSpec) -> Self {
        self.from_block = Some(from);
        self
    }

    pub fn with_to_block(mut self, to: BlockSpec) -> Self {
        self.to_block = Some(to);
        self
    }

    /// True if the criteria constrain nothing.
    pub fn is_empty(&self) -> bool {
        self.from_block.is_none()
            && self.to_block.is_none()
            && self.addresses.is_empty()
            && self.topics.iter().all(Vec::is_empty)
    }

    /// Validate against the configured limits.
    pub fn validate(&self, max_topics: usize, max_addresses: usize) -> Result<(), FilterError> {
        if self.topics.len() > max_topics {
            return Err(FilterError::TooManyTopics {
                count: self.topics.len(),
                max: max_topics,
            });
        }

        if self.addresses.len() > max_addresses {
            return Err(FilterError::InvalidCriteria(format!(
                "too many addresses: {} > {}",
                self.addresses.len(),
                max_addresses
            )));
        }

        let from = self.from_block.unwrap_or(BlockSpec::Tag(BlockTag::Latest));
        let to = self.to_block.unwrap_or(BlockSpec::Tag(BlockTag::Latest));

        if from.is_pending() || to.is_pending() {
            return Err(FilterError::PendingLogsUnsupported);
        }

        match (from.height(), to.height()) {
            // Open start with a fixed end can never see a new block
            (None, Some(_)) => Err(FilterError::InvalidBlockRange {
                from: from.to_string(),
                to: to.to_string(),
            }),
            (Some(f), Some(t)) if f > t => Err(FilterError::InvalidBlockRange {
                from: from.to_string(),
                to: to.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Check a single log against the criteria.
    pub fn matches_log(&self, log: &Log) -> bool {
        if let Some(from) = self.from_block.and_then(|b| b.height()) {
            if log.block_number < from {
                return false;
            }
        }
        if let Some(to) = self.to_block.and_then(|b| b.height()) {
            if log.block_number > to {
                return false;
            }
        }

        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }

        // More constrained slots than the log has topics
        if self.topics.len() > log.topics.len() {
            return false;
        }

        self.topics
            .iter()
            .zip(log.topics.iter())
            .all(|(slot, topic)| slot.is_empty() || slot.contains(topic))
    }

    /// Return the subset of `logs` that match.
    pub fn filter_logs(&self, logs: &[Log]) -> Vec<Log> {
        logs.iter()
            .filter(|log| self.matches_log(log))
            .cloned()
            .collect()
    }
}
