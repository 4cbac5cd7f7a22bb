//! # Bus Events
//!
//! Defines the event records that flow through the bus. Payloads arrive
//! already decoded from the consensus engine; the bus never inspects them.

use serde::{Deserialize, Serialize};
use shared_types::{BlockNumber, Hash, Header, Log};

/// Topic carrying one event per committed block header.
pub const NEW_BLOCK_HEADER_TOPIC: &str = "tm.event='NewBlockHeader'";

/// Topic carrying one event per executed EVM transaction.
pub const EVM_TX_TOPIC: &str = "tm.event='Tx' AND message.module='evm'";

/// A record published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Topic the record was published on.
    pub topic: String,
    /// Decoded payload.
    pub data: EventData,
}

impl BusEvent {
    /// Create an event on an arbitrary topic.
    pub fn new(topic: impl Into<String>, data: EventData) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }

    /// Create a header event on [`NEW_BLOCK_HEADER_TOPIC`].
    pub fn new_block_header(header: Header) -> Self {
        Self::new(NEW_BLOCK_HEADER_TOPIC, EventData::NewBlockHeader(header))
    }

    /// Create a transaction event on [`EVM_TX_TOPIC`].
    pub fn evm_tx(tx: TxEvent) -> Self {
        Self::new(EVM_TX_TOPIC, EventData::Tx(tx))
    }
}

/// Payload of a bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventData {
    /// A block header was committed.
    NewBlockHeader(Header),

    /// A transaction was executed.
    Tx(TxEvent),

    /// A payload the producer could not type. Consumers decode it on demand.
    Raw(serde_json::Value),
}

impl EventData {
    /// Short name of the payload variant, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewBlockHeader(_) => "NewBlockHeader",
            Self::Tx(_) => "Tx",
            Self::Raw(_) => "Raw",
        }
    }
}

/// An executed transaction and the logs it emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxEvent {
    /// Transaction hash.
    pub hash: Hash,
    /// Height of the including block.
    pub height: BlockNumber,
    /// Position of the transaction in the block.
    pub index: u64,
    /// Logs emitted during execution.
    #[serde(default)]
    pub logs: Vec<Log>,
}
