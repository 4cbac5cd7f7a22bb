//! Subscription kinds and topic derivation

use crate::error::FilterError;
use serde::{Deserialize, Serialize};
use shared_bus::{EVM_TX_TOPIC, NEW_BLOCK_HEADER_TOPIC};
use std::fmt;
use std::str::FromStr;

/// The closed set of subscription kinds.
///
/// The kind selects the upstream topic, the payload transform and the
/// delivery channel of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Contract logs matching a [`FilterCriteria`](super::FilterCriteria).
    #[serde(rename = "logs")]
    Logs,
    /// Headers of newly committed blocks.
    #[serde(rename = "newHeads")]
    NewHeads,
    /// Hashes of newly executed transactions.
    #[serde(rename = "newPendingTransactions")]
    PendingTransactions,
}

impl SubscriptionKind {
    /// Every kind, in index order.
    pub const ALL: [SubscriptionKind; 3] = [
        SubscriptionKind::Logs,
        SubscriptionKind::NewHeads,
        SubscriptionKind::PendingTransactions,
    ];

    /// JSON-RPC name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Logs => "logs",
            SubscriptionKind::NewHeads => "newHeads",
            SubscriptionKind::PendingTransactions => "newPendingTransactions",
        }
    }

    /// Upstream bus topic for this kind.
    ///
    /// Log subscriptions all share the transaction topic regardless of their
    /// criteria; individual filters are told apart by `Subscription::matches`.
    pub fn topic(&self) -> &'static str {
        match self {
            SubscriptionKind::NewHeads => NEW_BLOCK_HEADER_TOPIC,
            SubscriptionKind::Logs | SubscriptionKind::PendingTransactions => EVM_TX_TOPIC,
        }
    }

    /// True if this kind takes matching criteria.
    pub fn accepts_criteria(&self) -> bool {
        matches!(self, SubscriptionKind::Logs)
    }

    /// True if serving this kind needs full log data (unavailable in light mode).
    pub fn requires_full_node(&self) -> bool {
        matches!(self, SubscriptionKind::Logs)
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logs" => Ok(SubscriptionKind::Logs),
            "newHeads" => Ok(SubscriptionKind::NewHeads),
            "newPendingTransactions" => Ok(SubscriptionKind::PendingTransactions),
            other => Err(FilterError::UnknownKind(other.to_string())),
        }
    }
}
